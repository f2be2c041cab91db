use crate::{address, instruction::WarpInstruction};
use crate::sync::{Arc, Mutex};
use bitvec::BitArr;
use std::collections::VecDeque;

pub const WARP_SIZE: usize = 32;

pub type ActiveMask = BitArr!(for WARP_SIZE, in u32);

/// Fragment slots in the per-warp instruction buffer.
pub const IBUFFER_SIZE: usize = 2;

pub type Ref = Arc<Mutex<Warp>>;

/// A decoded instruction waiting to issue, tagged with the divergence
/// stack height its fragment was fetched at.
#[derive(Debug, Clone)]
pub struct IBufferEntry {
    pub instr: WarpInstruction,
    pub height: usize,
}

/// A fragment the fetch stage still has to bring in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFragment {
    pub height: usize,
    pub pc: address,
}

/// One SIMT execution context.
///
/// Owned by the shader core; the slot (`warp_id`) is stable while
/// `dynamic_warp_id` changes every time the slot is reallocated to a new
/// block.
#[derive(Debug, Default)]
pub struct Warp {
    pub warp_id: usize,
    pub dynamic_warp_id: usize,
    pub block_id: u64,
    pub next_pc: Option<address>,
    /// Lanes launched for this warp.
    pub active_mask: ActiveMask,
    pub num_active_threads: usize,
    pub num_instr_in_pipeline: usize,
    pub num_outstanding_stores: usize,
    pub num_outstanding_atomics: usize,
    pub waiting_for_memory_barrier: bool,
    pub done_exit: bool,
    pub imiss_pending: bool,
    instr_buffer: Vec<Option<IBufferEntry>>,
    next: usize,
    /// Fragments reported by the divergence stack, not yet fetched.
    pub pending_fragments: VecDeque<PendingFragment>,
}

impl Warp {
    #[must_use]
    pub fn new(warp_id: usize) -> Self {
        Self {
            warp_id,
            done_exit: true,
            instr_buffer: (0..IBUFFER_SIZE).map(|_| None).collect(),
            ..Self::default()
        }
    }

    pub fn init(
        &mut self,
        block_id: u64,
        dynamic_warp_id: usize,
        start_pc: address,
        active_mask: ActiveMask,
    ) {
        self.block_id = block_id;
        self.dynamic_warp_id = dynamic_warp_id;
        self.next_pc = Some(start_pc);
        self.active_mask = active_mask;
        self.num_active_threads = active_mask.count_ones();
        self.done_exit = false;
        self.reset_buffers();
    }

    pub fn reset(&mut self) {
        debug_assert_eq!(self.num_outstanding_stores, 0);
        debug_assert_eq!(self.num_instr_in_pipeline, 0);
        self.active_mask.fill(false);
        self.num_active_threads = 0;
        self.num_outstanding_atomics = 0;
        self.waiting_for_memory_barrier = false;
        self.done_exit = true;
        self.next_pc = None;
        self.reset_buffers();
    }

    fn reset_buffers(&mut self) {
        self.imiss_pending = false;
        self.next = 0;
        for slot in &mut self.instr_buffer {
            *slot = None;
        }
        self.pending_fragments.clear();
    }

    #[must_use]
    pub fn functional_done(&self) -> bool {
        self.num_active_threads == 0
    }

    #[must_use]
    pub fn hardware_done(&self) -> bool {
        self.functional_done()
            && self.num_outstanding_stores == 0
            && self.num_instr_in_pipeline == 0
    }

    // instruction buffer

    #[must_use]
    pub fn ibuffer_empty(&self) -> bool {
        self.instr_buffer.iter().all(Option::is_none)
    }

    #[must_use]
    pub fn ibuffer_free_slot(&self) -> Option<usize> {
        (0..IBUFFER_SIZE)
            .map(|i| (self.next + i) % IBUFFER_SIZE)
            .find(|&slot| self.instr_buffer[slot].is_none())
    }

    pub fn ibuffer_fill(&mut self, slot: usize, height: usize, instr: WarpInstruction) {
        debug_assert!(self.instr_buffer[slot].is_none());
        self.instr_buffer[slot] = Some(IBufferEntry { instr, height });
    }

    #[must_use]
    pub fn ibuffer_entry(&self, slot: usize) -> Option<&IBufferEntry> {
        self.instr_buffer[slot].as_ref()
    }

    /// Occupied slots in round robin order starting at the head.
    pub fn occupied_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..IBUFFER_SIZE)
            .map(|i| (self.next + i) % IBUFFER_SIZE)
            .filter(|&slot| self.instr_buffer[slot].is_some())
    }

    pub fn ibuffer_take(&mut self, slot: usize) -> Option<IBufferEntry> {
        let entry = self.instr_buffer[slot].take();
        if entry.is_some() {
            self.next = (slot + 1) % IBUFFER_SIZE;
        }
        entry
    }

    pub fn ibuffer_flush_slot(&mut self, slot: usize) {
        self.instr_buffer[slot] = None;
    }

    /// Drop every buffered instruction and pending fragment.
    ///
    /// Called when the base divergence level leaves the stack at warp
    /// exit: nothing still waiting to issue has a stack entry left to
    /// point at. Buffered instructions have not issued, so the
    /// in-pipeline count is untouched.
    pub fn flush_fragments(&mut self) {
        for slot in &mut self.instr_buffer {
            *slot = None;
        }
        self.pending_fragments.clear();
    }

    /// Heights already accounted for in the buffer or awaiting fetch,
    /// excluded when asking the divergence stack for new fragments.
    #[must_use]
    pub fn cached_heights(&self) -> Vec<usize> {
        self.instr_buffer
            .iter()
            .flatten()
            .map(|entry| entry.height)
            .chain(self.pending_fragments.iter().map(|frag| frag.height))
            .collect()
    }

    /// Shift every cached height at or above `at` down by `removed`
    /// divergence levels.
    ///
    /// Called after an issued branch or reconvergence instruction popped
    /// levels off the stack, so buffered fragments keep pointing at the
    /// stack entry they came from.
    pub fn renumber_heights(&mut self, at: usize, removed: usize) {
        debug_assert!(removed > 0);
        for entry in self.instr_buffer.iter_mut().flatten() {
            if entry.height >= at {
                debug_assert!(entry.height >= removed);
                entry.height -= removed;
                entry.instr.height = entry.height;
            }
        }
        for frag in &mut self.pending_fragments {
            if frag.height >= at {
                debug_assert!(frag.height >= removed);
                frag.height -= removed;
            }
        }
    }

    #[must_use]
    pub fn done_exit(&self) -> bool {
        self.done_exit
    }
}
