use super::{preferred_stage, Policy, Request};
use crate::warp;

/// Order warps by how many lanes they could actually issue this cycle.
///
/// Runs the issue eligibility checks as a dry run per resident fragment,
/// committing nothing, and puts the warps with the highest issuable lane
/// count first. Warps with equal counts keep their relative order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FragmentUtilization;

fn issuable_lanes(warp_ref: &warp::Ref, req: &Request<'_>) -> usize {
    let warp = warp_ref.try_lock();
    if warp.done_exit() || warp.imiss_pending {
        return 0;
    }
    let warp_id = warp.warp_id;
    let key = (warp_id, req.cycle);
    let mut lanes = 0;
    for slot in warp.occupied_slots() {
        let Some(entry) = warp.ibuffer_entry(slot) else {
            continue;
        };
        let Some(pdom) = req.issuer.pdom_entry(warp_id, entry.height) else {
            continue;
        };
        if pdom.pc != entry.instr.pc {
            continue;
        }
        let active_mask = req.issuer.active_mask(warp_id, entry.height);
        if req
            .scoreboard
            .check_collision(warp_id, &entry.instr, &active_mask)
        {
            continue;
        }
        if !req
            .issuer
            .stage_can_accept(preferred_stage(entry.instr.opcode.category), key)
        {
            continue;
        }
        lanes += active_mask.count_ones();
    }
    lanes
}

impl Policy for FragmentUtilization {
    fn order_warps(&mut self, req: Request<'_>) -> Vec<warp::Ref> {
        let mut scored: Vec<(usize, warp::Ref)> = req
            .supervised
            .iter()
            .map(|warp_ref| (issuable_lanes(warp_ref, &req), warp_ref.clone()))
            .collect();
        scored.sort_by_key(|(lanes, _)| std::cmp::Reverse(*lanes));
        scored.into_iter().map(|(_, warp_ref)| warp_ref).collect()
    }
}
