use crate::sync::{Arc, Mutex};
use crate::{core::PipelineStage, instruction::WarpInstruction, UniqueWarpKey};

pub type Ref = Arc<Mutex<RegisterSet>>;

/// Transfer an instruction between two pipeline slots.
pub fn move_warp<T>(from: Option<T>, to: &mut Option<T>) {
    debug_assert!(to.is_none());
    *to = from;
}

/// A fixed-capacity pipeline register stage.
///
/// Slots hold instructions in flight between two pipeline stages; the
/// oldest resident instruction (smallest uid) is the one considered
/// "ready" for the consuming stage.
#[derive(Debug, Clone)]
pub struct RegisterSet {
    pub stage: PipelineStage,
    pub id: usize,
    pub regs: Box<[Option<WarpInstruction>]>,
}

impl RegisterSet {
    #[must_use]
    pub fn new(stage: PipelineStage, width: usize, id: usize) -> Self {
        let regs = (0..width).map(|_| None).collect();
        Self { stage, id, regs }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.regs.len()
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = &WarpInstruction> {
        self.regs.iter().flatten()
    }

    #[must_use]
    pub fn has_free(&self) -> bool {
        self.regs.iter().any(Option::is_none)
    }

    #[must_use]
    pub fn has_ready(&self) -> bool {
        self.regs.iter().any(Option::is_some)
    }

    pub fn get_free_mut(&mut self) -> Option<&mut Option<WarpInstruction>> {
        self.regs.iter_mut().find(|slot| slot.is_none())
    }

    /// The oldest resident instruction.
    pub fn get_ready(&self) -> Option<&WarpInstruction> {
        self.iter_occupied().min_by_key(|instr| instr.uid)
    }

    pub fn get_ready_mut(&mut self) -> Option<&mut Option<WarpInstruction>> {
        self.regs
            .iter_mut()
            .filter(|slot| slot.is_some())
            .min_by_key(|slot| slot.as_ref().map(|instr| instr.uid))
    }

    /// Take the oldest resident instruction out of the stage.
    pub fn take_ready(&mut self) -> Option<WarpInstruction> {
        self.get_ready_mut().and_then(Option::take)
    }

    pub fn move_in_from(&mut self, instr: Option<WarpInstruction>) {
        let Some(free) = self.get_free_mut() else {
            panic!("register set {:?}: move in without free slot", self.stage);
        };
        move_warp(instr, free);
    }

    // unique warp accounting
    //
    // Fragments of one warp issued in the same cycle share a
    // (warp id, issue cycle) key and occupy "one warp's worth" of stage
    // width even when they fill several slots.

    #[must_use]
    pub fn contains_key(&self, key: UniqueWarpKey) -> bool {
        self.iter_occupied().any(|instr| instr.unique_key() == key)
    }

    #[must_use]
    pub fn num_unique_keys(&self) -> usize {
        use itertools::Itertools;
        self.iter_occupied()
            .map(WarpInstruction::unique_key)
            .unique()
            .count()
    }

    /// Can an instruction with `key` enter this stage, given a cap on
    /// distinct resident issue groups?
    #[must_use]
    pub fn can_accept(&self, key: UniqueWarpKey, max_unique_keys: usize) -> bool {
        self.has_free() && (self.contains_key(key) || self.num_unique_keys() < max_unique_keys)
    }
}

impl std::fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}={:?}", self.stage, self.regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ArchOp, Op, Opcode};

    fn instr(uid: u64, warp_id: usize, issue_cycle: u64) -> WarpInstruction {
        let mut instr = WarpInstruction::new(
            Opcode {
                op: Op::IADD,
                category: ArchOp::INT_OP,
            },
            0x100,
        );
        instr.uid = uid;
        instr.warp_id = warp_id;
        instr.issue_cycle = Some(issue_cycle);
        instr
    }

    #[test]
    fn test_ready_is_oldest_uid() {
        let mut set = RegisterSet::new(PipelineStage::ID_OC_SP, 4, 0);
        set.move_in_from(Some(instr(7, 0, 1)));
        set.move_in_from(Some(instr(3, 1, 1)));
        set.move_in_from(Some(instr(5, 2, 1)));
        assert_eq!(set.get_ready().map(|i| i.uid), Some(3));
        assert_eq!(set.take_ready().map(|i| i.uid), Some(3));
        assert_eq!(set.get_ready().map(|i| i.uid), Some(5));
    }

    #[test]
    fn test_unique_key_accounting() {
        let mut set = RegisterSet::new(PipelineStage::ID_OC_SP, 4, 0);
        // two fragments of warp 0 issued in cycle 10 count once
        set.move_in_from(Some(instr(1, 0, 10)));
        set.move_in_from(Some(instr(2, 0, 10)));
        set.move_in_from(Some(instr(3, 1, 10)));
        assert_eq!(set.num_unique_keys(), 2);
        assert!(set.contains_key((0, 10)));
        assert!(!set.contains_key((0, 11)));

        // a resident group may always add fragments
        assert!(set.can_accept((0, 10), 2));
        // a new group is rejected at the cap
        assert!(!set.can_accept((2, 10), 2));
        assert!(set.can_accept((2, 10), 3));
    }

    #[test]
    #[should_panic(expected = "move in without free slot")]
    fn test_move_in_requires_free_slot() {
        let mut set = RegisterSet::new(PipelineStage::ID_OC_SP, 1, 0);
        set.move_in_from(Some(instr(1, 0, 0)));
        set.move_in_from(Some(instr(2, 1, 0)));
    }
}
