use super::{Policy, Request};
use crate::warp;

/// Loose round robin: the scan starts just after the warp that issued
/// last, so every supervised warp gets the front position once per
/// rotation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lrr;

impl Policy for Lrr {
    fn order_warps(&mut self, req: Request<'_>) -> Vec<warp::Ref> {
        let num = req.supervised.len();
        if num == 0 {
            return Vec::new();
        }
        let start = (req.last_issued_idx + 1) % num;
        (0..num)
            .map(|i| req.supervised[(start + i) % num].clone())
            .collect()
    }
}
