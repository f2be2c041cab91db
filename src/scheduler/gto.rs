use super::{sort_by_oldest_dynamic_id, Policy, Request};
use crate::sync::Arc;
use crate::warp;

/// Greedy then oldest: the previously issued warp keeps the front spot
/// as long as it can issue again; everyone else follows in dynamic-id
/// order, oldest first.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gto;

pub(super) fn greedy_then_oldest(
    supervised: &[warp::Ref],
    last_issued_idx: usize,
    mut candidates: Vec<warp::Ref>,
) -> Vec<warp::Ref> {
    sort_by_oldest_dynamic_id(&mut candidates);
    if let Some(greedy) = supervised.get(last_issued_idx) {
        if let Some(pos) = candidates
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, greedy))
        {
            let greedy = candidates.remove(pos);
            candidates.insert(0, greedy);
        }
    }
    candidates
}

impl Policy for Gto {
    fn order_warps(&mut self, req: Request<'_>) -> Vec<warp::Ref> {
        greedy_then_oldest(req.supervised, req.last_issued_idx, req.supervised.to_vec())
    }
}
