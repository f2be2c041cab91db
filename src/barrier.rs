use crate::config;
use bitvec::BitArr;
use std::collections::HashMap;

pub type WarpMask = BitArr!(for config::MAX_WARPS_PER_CORE);

/// Synchronization state of the blocks resident on one core.
///
/// Tracks, per block, which warp slots belong to it, which warps are
/// still active, and which are parked at a barrier. Warps of one block
/// are released together in the step where every active warp has
/// arrived; there is no partial release.
#[derive(Debug, Clone)]
pub struct BarrierSet {
    max_blocks_per_core: usize,
    warps_per_block: HashMap<u64, WarpMask>,
    active_warps: WarpMask,
    warps_at_barrier: WarpMask,
}

impl BarrierSet {
    #[must_use]
    pub fn new(max_blocks_per_core: usize) -> Self {
        Self {
            max_blocks_per_core,
            warps_per_block: HashMap::new(),
            active_warps: WarpMask::ZERO,
            warps_at_barrier: WarpMask::ZERO,
        }
    }

    /// Register a newly launched block's warps as active.
    pub fn allocate(&mut self, block_id: u64, warps: WarpMask) {
        assert!(
            !self.warps_per_block.contains_key(&block_id),
            "barrier set: block {block_id} allocated twice"
        );
        assert!(
            self.warps_per_block.len() < self.max_blocks_per_core,
            "barrier set: exceeded maximum number of blocks per core"
        );
        self.active_warps |= warps;
        self.warps_at_barrier &= !warps;
        self.warps_per_block.insert(block_id, warps);
    }

    /// Deallocate a retired block.
    ///
    /// Only valid once none of the block's warps are active or parked.
    pub fn deallocate(&mut self, block_id: u64) {
        let Some(warps) = self.warps_per_block.remove(&block_id) else {
            panic!("barrier set: deallocate of unknown block {block_id}");
        };
        assert!(
            (self.active_warps & warps).not_any(),
            "barrier set: block {block_id} deallocated with active warps"
        );
        assert!(
            (self.warps_at_barrier & warps).not_any(),
            "barrier set: block {block_id} deallocated with warps at barrier"
        );
    }

    /// Park a warp at its block's barrier, releasing the whole block if
    /// every active warp has now arrived.
    pub fn warp_reached_barrier(&mut self, block_id: u64, warp_id: usize) {
        let Some(&warps_in_block) = self.warps_per_block.get(&block_id) else {
            panic!("barrier set: warp {warp_id} reaches barrier in unknown block {block_id}");
        };
        debug_assert!(warps_in_block[warp_id]);
        self.warps_at_barrier.set(warp_id, true);

        let at_barrier = self.warps_at_barrier & warps_in_block;
        let active = self.active_warps & warps_in_block;
        if at_barrier == active {
            self.warps_at_barrier &= !at_barrier;
        }
    }

    /// Remove a fully retired warp from the active set and re-evaluate
    /// its block, so an exited warp never blocks waiting siblings.
    pub fn warp_exited(&mut self, warp_id: usize) {
        if !self.active_warps[warp_id] {
            return;
        }
        self.active_warps.set(warp_id, false);

        let block_id = self
            .warps_per_block
            .iter()
            .find(|(_, warps)| warps[warp_id])
            .map(|(block_id, _)| *block_id);
        if let Some(block_id) = block_id {
            let warps_in_block = self.warps_per_block[&block_id];
            let at_barrier = self.warps_at_barrier & warps_in_block;
            let active = self.active_warps & warps_in_block;
            if active.any() && at_barrier == active {
                self.warps_at_barrier &= !at_barrier;
            }
        }
    }

    #[must_use]
    pub fn is_waiting_at_barrier(&self, warp_id: usize) -> bool {
        self.warps_at_barrier[warp_id]
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.warps_per_block.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{BarrierSet, WarpMask};

    fn warps(ids: &[usize]) -> WarpMask {
        let mut mask = WarpMask::ZERO;
        for &id in ids {
            mask.set(id, true);
        }
        mask
    }

    #[test]
    fn test_release_is_atomic() {
        let mut barriers = BarrierSet::new(8);
        barriers.allocate(0, warps(&[0, 1, 2]));

        barriers.warp_reached_barrier(0, 0);
        barriers.warp_reached_barrier(0, 1);
        assert!(barriers.is_waiting_at_barrier(0));
        assert!(barriers.is_waiting_at_barrier(1));
        assert!(!barriers.is_waiting_at_barrier(2));

        // last arrival releases everyone in the same step
        barriers.warp_reached_barrier(0, 2);
        assert!(!barriers.is_waiting_at_barrier(0));
        assert!(!barriers.is_waiting_at_barrier(1));
        assert!(!barriers.is_waiting_at_barrier(2));
    }

    #[test]
    fn test_exited_warp_does_not_block_siblings() {
        let mut barriers = BarrierSet::new(8);
        barriers.allocate(3, warps(&[4, 5]));

        barriers.warp_reached_barrier(3, 4);
        assert!(barriers.is_waiting_at_barrier(4));

        // warp 5 retires without ever reaching the barrier
        barriers.warp_exited(5);
        assert!(!barriers.is_waiting_at_barrier(4));
    }

    #[test]
    fn test_deallocate_after_all_warps_exit() {
        let mut barriers = BarrierSet::new(8);
        barriers.allocate(1, warps(&[0, 1]));
        barriers.warp_exited(0);
        barriers.warp_exited(1);
        barriers.deallocate(1);
        assert_eq!(barriers.num_blocks(), 0);
    }

    #[test]
    #[should_panic(expected = "deallocated with active warps")]
    fn test_deallocate_with_active_warps_is_fatal() {
        let mut barriers = BarrierSet::new(8);
        barriers.allocate(1, warps(&[0, 1]));
        barriers.deallocate(1);
    }

    #[test]
    #[should_panic(expected = "unknown block")]
    fn test_barrier_in_unknown_block_is_fatal() {
        let mut barriers = BarrierSet::new(8);
        barriers.warp_reached_barrier(9, 0);
    }

    #[test]
    fn test_two_blocks_are_independent() {
        let mut barriers = BarrierSet::new(8);
        barriers.allocate(0, warps(&[0, 1]));
        barriers.allocate(1, warps(&[2, 3]));

        barriers.warp_reached_barrier(0, 0);
        barriers.warp_reached_barrier(1, 2);
        barriers.warp_reached_barrier(1, 3);

        // block 1 released, block 0 still waiting
        assert!(barriers.is_waiting_at_barrier(0));
        assert!(!barriers.is_waiting_at_barrier(2));
        assert!(!barriers.is_waiting_at_barrier(3));
    }
}
