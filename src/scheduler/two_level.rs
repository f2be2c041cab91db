use super::{Policy, Request};
use crate::sync::Arc;
use crate::warp;
use std::collections::VecDeque;

/// Two-level active scheduler.
///
/// A bounded active subset competes for issue each cycle; warps found
/// waiting on a long scoreboard-tracked operation are demoted to a
/// pending queue and replaced by promoting from its front. Within the
/// active subset the order is strict round robin.
#[derive(Debug)]
pub struct TwoLevelActive {
    max_active: usize,
    active: Vec<warp::Ref>,
    pending: VecDeque<warp::Ref>,
    initialized: bool,
}

impl TwoLevelActive {
    #[must_use]
    pub fn new(max_active: usize) -> Self {
        assert!(max_active > 0, "two level scheduler needs a positive active set");
        Self {
            max_active,
            active: Vec::new(),
            pending: VecDeque::new(),
            initialized: false,
        }
    }

    fn initialize(&mut self, supervised: &[warp::Ref]) {
        self.active = supervised.iter().take(self.max_active).cloned().collect();
        self.pending = supervised.iter().skip(self.max_active).cloned().collect();
        self.initialized = true;
    }

    /// True if the warp's head instruction waits on an outstanding
    /// long-latency operation.
    fn waits_on_long_op(
        warp_ref: &warp::Ref,
        scoreboard: &dyn crate::scoreboard::Access<crate::instruction::WarpInstruction>,
    ) -> bool {
        let warp = warp_ref.try_lock();
        if warp.done_exit() {
            return false;
        }
        let Some(slot) = warp.occupied_slots().next() else {
            return false;
        };
        let Some(entry) = warp.ibuffer_entry(slot) else {
            return false;
        };
        entry
            .instr
            .registers()
            .iter()
            .any(|&reg| scoreboard.is_long_op(warp.warp_id, reg))
    }
}

impl Policy for TwoLevelActive {
    fn order_warps(&mut self, req: Request<'_>) -> Vec<warp::Ref> {
        if !self.initialized {
            self.initialize(req.supervised);
        }

        // demote, then refill from the pending queue
        let mut idx = 0;
        while idx < self.active.len() {
            if Self::waits_on_long_op(&self.active[idx], req.scoreboard) {
                let demoted = self.active.remove(idx);
                self.pending.push_back(demoted);
            } else {
                idx += 1;
            }
        }
        while self.active.len() < self.max_active {
            let Some(promoted) = self.pending.pop_front() else {
                break;
            };
            self.active.push(promoted);
        }

        if self.active.is_empty() {
            return Vec::new();
        }

        // strict round robin within the active subset
        let start = req
            .supervised
            .get(req.last_issued_idx)
            .and_then(|last| {
                self.active
                    .iter()
                    .position(|active| Arc::ptr_eq(active, last))
            })
            .map_or(0, |pos| (pos + 1) % self.active.len());
        let num = self.active.len();
        (0..num)
            .map(|i| self.active[(start + i) % num].clone())
            .collect()
    }
}
