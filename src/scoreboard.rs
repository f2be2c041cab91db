use crate::{instruction::WarpInstruction, warp::ActiveMask};

/// Hazard-table access as seen by schedulers and the writeback stage.
pub trait Access<I>: Send + Sync + 'static {
    /// True if any register `instr` touches has a reservation whose lanes
    /// intersect `mask`.
    fn check_collision(&self, warp_id: usize, instr: &I, mask: &ActiveMask) -> bool;

    fn pending_writes(&self, warp_id: usize) -> bool;

    /// True if `reg` is the destination of an outstanding long latency
    /// memory operation.
    fn is_long_op(&self, warp_id: usize, reg: u32) -> bool;

    fn reserve(&mut self, warp_id: usize, reg: u32, mask: ActiveMask);

    fn reserve_all(&mut self, instr: &I);

    fn release(&mut self, warp_id: usize, reg: u32, mask: ActiveMask);

    fn release_all(&mut self, instr: &I);
}

/// One reservation: lanes of `reg` with an in-flight write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub reg: u32,
    pub mask: ActiveMask,
}

/// Register scoreboard tracking in-flight writes at lane granularity.
///
/// Divergent fragments of one warp may concurrently write disjoint lanes
/// of the same architectural register, so a reservation is a `(reg, mask)`
/// pair rather than a whole register. Entries for one register stay
/// lane-disjoint; violating that is a model bug and aborts.
#[derive(Debug)]
pub struct Scoreboard {
    pub core_id: usize,
    pub cluster_id: usize,
    reg_table: Box<[Vec<Entry>]>,
    long_op_table: Box<[Vec<Entry>]>,
}

impl Scoreboard {
    #[must_use]
    pub fn new(cluster_id: usize, core_id: usize, max_warps: usize) -> Self {
        let reg_table = vec![Vec::new(); max_warps].into_boxed_slice();
        let long_op_table = vec![Vec::new(); max_warps].into_boxed_slice();
        Self {
            core_id,
            cluster_id,
            reg_table,
            long_op_table,
        }
    }

    /// Reservations of one warp, in reservation order.
    #[must_use]
    pub fn entries(&self, warp_id: usize) -> &[Entry] {
        &self.reg_table[warp_id]
    }

    fn reserve_in(table: &mut Vec<Entry>, warp_id: usize, reg: u32, mask: ActiveMask) {
        for entry in table.iter().filter(|entry| entry.reg == reg) {
            assert!(
                (entry.mask & mask).not_any(),
                "scoreboard: warp {warp_id} reserves lanes of register {reg} twice (reserved {:?}, requested {:?})",
                entry.mask,
                mask,
            );
        }
        table.push(Entry { reg, mask });
    }

    fn release_in(table: &mut Vec<Entry>, warp_id: usize, reg: u32, mask: ActiveMask) {
        let mut to_release = mask;
        for entry in table.iter_mut().filter(|entry| entry.reg == reg) {
            let hit = entry.mask & to_release;
            entry.mask &= !to_release;
            to_release &= !hit;
        }
        assert!(
            to_release.not_any(),
            "scoreboard: warp {warp_id} releases lanes of register {reg} that were never reserved ({to_release:?})",
        );
        table.retain(|entry| entry.mask.any());
    }

    /// Clear lanes of a long-op reservation without touching the hazard
    /// table; a no-op for lanes that never were long ops.
    fn release_long_op(&mut self, warp_id: usize, reg: u32, mask: ActiveMask) {
        let table = &mut self.long_op_table[warp_id];
        for entry in table.iter_mut().filter(|entry| entry.reg == reg) {
            entry.mask &= !mask;
        }
        table.retain(|entry| entry.mask.any());
    }
}

impl Access<WarpInstruction> for Scoreboard {
    fn check_collision(&self, warp_id: usize, instr: &WarpInstruction, mask: &ActiveMask) -> bool {
        let table = &self.reg_table[warp_id];
        if table.is_empty() {
            return false;
        }
        instr.registers().iter().any(|reg| {
            table
                .iter()
                .any(|entry| entry.reg == *reg && (entry.mask & *mask).any())
        })
    }

    fn pending_writes(&self, warp_id: usize) -> bool {
        !self.reg_table[warp_id].is_empty()
    }

    fn is_long_op(&self, warp_id: usize, reg: u32) -> bool {
        self.long_op_table[warp_id]
            .iter()
            .any(|entry| entry.reg == reg)
    }

    fn reserve(&mut self, warp_id: usize, reg: u32, mask: ActiveMask) {
        log::trace!(
            "scoreboard: warp {} reserve r{} mask {:?}",
            warp_id,
            reg,
            mask
        );
        Self::reserve_in(&mut self.reg_table[warp_id], warp_id, reg, mask);
    }

    fn reserve_all(&mut self, instr: &WarpInstruction) {
        for reg in instr.dest_regs() {
            self.reserve(instr.warp_id, reg, instr.active_mask);
            if instr.is_load()
                && instr.memory_space != Some(crate::instruction::MemorySpace::Shared)
            {
                Self::reserve_in(
                    &mut self.long_op_table[instr.warp_id],
                    instr.warp_id,
                    reg,
                    instr.active_mask,
                );
            }
        }
    }

    fn release(&mut self, warp_id: usize, reg: u32, mask: ActiveMask) {
        log::trace!(
            "scoreboard: warp {} release r{} mask {:?}",
            warp_id,
            reg,
            mask
        );
        Self::release_in(&mut self.reg_table[warp_id], warp_id, reg, mask);
        self.release_long_op(warp_id, reg, mask);
    }

    fn release_all(&mut self, instr: &WarpInstruction) {
        for reg in instr.dest_regs() {
            self.release(instr.warp_id, reg, instr.active_mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, Scoreboard};
    use crate::instruction::WarpInstruction;
    use crate::opcodes::{ArchOp, Op, Opcode};
    use crate::warp::ActiveMask;

    fn mask(bits: u32) -> ActiveMask {
        ActiveMask::from([bits])
    }

    fn writer(warp_id: usize, out: u32, active: ActiveMask) -> WarpInstruction {
        let mut instr = WarpInstruction::new(
            Opcode {
                op: Op::IADD,
                category: ArchOp::INT_OP,
            },
            0x100,
        );
        instr.warp_id = warp_id;
        instr.outputs[0] = Some(out);
        instr.active_mask = active;
        instr
    }

    fn reader(warp_id: usize, input: u32, active: ActiveMask) -> WarpInstruction {
        let mut instr = writer(warp_id, 99, active);
        instr.outputs[0] = None;
        instr.inputs[0] = Some(input);
        instr
    }

    #[test]
    fn test_disjoint_masks_coexist() {
        let mut sb = Scoreboard::new(0, 0, 4);
        sb.reserve(1, 5, mask(0x0000_ffff));
        sb.reserve(1, 5, mask(0xffff_0000));
        assert!(sb.pending_writes(1));
        assert_eq!(sb.entries(1).len(), 2);
    }

    #[test]
    #[should_panic(expected = "reserves lanes of register 5 twice")]
    fn test_overlapping_reserve_is_fatal() {
        let mut sb = Scoreboard::new(0, 0, 4);
        sb.reserve(1, 5, mask(0x0000_ffff));
        sb.reserve(1, 5, mask(0x0000_0001));
    }

    #[test]
    #[should_panic(expected = "never reserved")]
    fn test_release_of_unreserved_lanes_is_fatal() {
        let mut sb = Scoreboard::new(0, 0, 4);
        sb.reserve(1, 5, mask(0x0000_00ff));
        sb.release(1, 5, mask(0x0000_ff00));
    }

    #[test]
    fn test_reserve_release_round_trip() {
        let mut sb = Scoreboard::new(0, 0, 4);
        assert!(!sb.pending_writes(2));
        sb.reserve(2, 7, mask(0xffff_ffff));
        assert!(sb.pending_writes(2));
        sb.release(2, 7, mask(0xffff_ffff));
        assert!(!sb.pending_writes(2));
    }

    #[test]
    fn test_collision_is_lane_wise() {
        let mut sb = Scoreboard::new(0, 0, 4);
        sb.reserve(0, 5, mask(0xffff_0000));

        // same register, disjoint lanes: no hazard
        let low = reader(0, 5, mask(0x0000_ffff));
        assert!(!sb.check_collision(0, &low, &mask(0x0000_ffff)));

        // overlapping lanes: hazard
        let high = reader(0, 5, mask(0x00ff_0000));
        assert!(sb.check_collision(0, &high, &mask(0x00ff_0000)));
    }

    #[test]
    fn test_full_then_half_mask_scenario() {
        let mut sb = Scoreboard::new(0, 0, 4);
        // instruction A reserves all lanes of r5
        let a = writer(0, 5, mask(0xffff_ffff));
        sb.reserve_all(&a);

        // instruction B targets the low half and must collide
        let b = writer(0, 5, mask(0x0000_ffff));
        assert!(sb.check_collision(0, &b, &mask(0x0000_ffff)));

        // releasing A entirely clears the hazard
        sb.release_all(&a);
        assert!(!sb.check_collision(0, &b, &mask(0x0000_ffff)));
    }

    #[test]
    fn test_long_op_tracking() {
        let mut sb = Scoreboard::new(0, 0, 4);
        let mut load = writer(0, 9, mask(0xf));
        load.opcode = Opcode {
            op: Op::LDG,
            category: ArchOp::LOAD_OP,
        };
        sb.reserve_all(&load);
        assert!(sb.is_long_op(0, 9));
        assert!(!sb.is_long_op(0, 10));

        sb.release(0, 9, mask(0xf));
        assert!(!sb.is_long_op(0, 9));
        assert!(!sb.pending_writes(0));
    }
}
