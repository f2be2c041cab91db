use crate::sync::{Arc, Mutex};
use crate::{address, instruction::WarpInstruction, warp::ActiveMask};
use std::collections::VecDeque;

pub type Ref = Arc<Mutex<Box<dyn Stack>>>;

/// One divergent execution path available for fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub height: usize,
    pub pc: address,
}

/// Program counters recorded for one divergence stack level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdomEntry {
    pub pc: address,
    pub reconvergence_pc: Option<address>,
}

/// Per-warp divergence stack, consumed through a narrow read interface.
///
/// The reconvergence algorithm lives outside the timing model. The core
/// reads expected program counters and active masks per height, asks for
/// fetchable fragments, and reports issued instructions back through
/// [`Stack::update`]. When an update removes `k` levels at height `h`,
/// every height the core has cached at or above `h` must be renumbered
/// down by `k` (see [`crate::warp::Warp::renumber_heights`]).
pub trait Stack: Send + Sync + 'static {
    /// Reinitialize the stack for a freshly launched warp.
    fn launch(&mut self, start_pc: address, active_mask: ActiveMask);

    /// Paths that may be fetched this cycle, deepest first.
    ///
    /// `excluded_heights` lists heights the core already buffered; with
    /// `multi_exec` disabled only the top of the stack is offered.
    fn fragments(&self, excluded_heights: &[usize], multi_exec: bool) -> VecDeque<Fragment>;

    /// Expected and reconvergence PC at `height`, if that level is valid.
    fn pdom_entry(&self, height: usize) -> Option<PdomEntry>;

    /// Lanes active on the path at `height`.
    fn active_mask(&self, height: usize) -> ActiveMask;

    /// Number of valid stack levels.
    fn depth(&self) -> usize;

    /// Account an issued instruction, returning the number of levels
    /// removed at the instruction's height (0 when the stack grew or was
    /// left unchanged).
    fn update(&mut self, instr: &WarpInstruction) -> usize;
}

/// Divergence-free stack: one level that follows straight-line code.
///
/// Useful as a driver for workloads without branches and as a test
/// double; `EXIT` pops the single level and retires the warp's path.
#[derive(Debug, Default)]
pub struct FlatStack {
    entry: Option<(address, ActiveMask)>,
}

impl Stack for FlatStack {
    fn launch(&mut self, start_pc: address, active_mask: ActiveMask) {
        self.entry = Some((start_pc, active_mask));
    }

    fn fragments(&self, excluded_heights: &[usize], _multi_exec: bool) -> VecDeque<Fragment> {
        let mut fragments = VecDeque::new();
        if let Some((pc, _)) = self.entry {
            if !excluded_heights.contains(&0) {
                fragments.push_back(Fragment { height: 0, pc });
            }
        }
        fragments
    }

    fn pdom_entry(&self, height: usize) -> Option<PdomEntry> {
        match self.entry {
            Some((pc, _)) if height == 0 => Some(PdomEntry {
                pc,
                reconvergence_pc: None,
            }),
            _ => None,
        }
    }

    fn active_mask(&self, height: usize) -> ActiveMask {
        match self.entry {
            Some((_, mask)) if height == 0 => mask,
            _ => ActiveMask::ZERO,
        }
    }

    fn depth(&self) -> usize {
        usize::from(self.entry.is_some())
    }

    fn update(&mut self, instr: &WarpInstruction) -> usize {
        use crate::opcodes::ArchOp;
        match instr.opcode.category {
            ArchOp::EXIT_OPS => {
                self.entry = None;
                1
            }
            _ => {
                if let Some((pc, _)) = &mut self.entry {
                    *pc = instr.pc + u64::from(instr.isize);
                }
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ArchOp, Op, Opcode};

    #[test]
    fn test_flat_stack_follows_straight_line() {
        let mut stack = FlatStack::default();
        let mut mask = ActiveMask::ZERO;
        mask[..4].fill(true);
        stack.launch(0x100, mask);
        assert_eq!(stack.depth(), 1);

        let frags = stack.fragments(&[], true);
        assert_eq!(
            frags.front(),
            Some(&Fragment {
                height: 0,
                pc: 0x100
            })
        );
        // already buffered heights are not offered again
        assert!(stack.fragments(&[0], true).is_empty());

        let mut instr = WarpInstruction::new(
            Opcode {
                op: Op::IADD,
                category: ArchOp::INT_OP,
            },
            0x100,
        );
        instr.isize = 8;
        assert_eq!(stack.update(&instr), 0);
        assert_eq!(stack.pdom_entry(0).unwrap().pc, 0x108);

        let mut exit = WarpInstruction::new(
            Opcode {
                op: Op::EXIT,
                category: ArchOp::EXIT_OPS,
            },
            0x108,
        );
        exit.isize = 8;
        assert_eq!(stack.update(&exit), 1);
        assert_eq!(stack.depth(), 0);
    }
}
