use super::{gto::greedy_then_oldest, sort_by_oldest_dynamic_id, Policy, Request};
use crate::warp;

/// Greedy then oldest over a capped candidate set.
///
/// Restricting the number of warps competing for issue reduces cache
/// thrashing for workloads that lose locality under full multithreading.
#[derive(Debug, Clone, Copy)]
pub struct WarpLimiting {
    limit: usize,
}

impl WarpLimiting {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "warp limiting scheduler needs a positive warp cap");
        Self { limit }
    }
}

impl Policy for WarpLimiting {
    fn order_warps(&mut self, req: Request<'_>) -> Vec<warp::Ref> {
        let mut candidates = req.supervised.to_vec();
        sort_by_oldest_dynamic_id(&mut candidates);
        candidates.truncate(self.limit.min(req.supervised.len()));
        greedy_then_oldest(req.supervised, req.last_issued_idx, candidates)
    }
}
