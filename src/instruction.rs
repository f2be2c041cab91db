use crate::{
    address,
    mem_fetch::access::MemAccess,
    opcodes::{ArchOp, Opcode},
    warp::ActiveMask,
    UniqueWarpKey,
};
use smallvec::SmallVec;
use std::collections::VecDeque;

pub const MAX_OUTPUT_REGS: usize = 4;
/// Four source registers plus the predicate and two address registers.
pub const MAX_INPUT_REGS: usize = 7;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemorySpace {
    Local,
    Shared,
    Constant,
    Texture,
    Global,
}

pub const GLOBAL_HEAP_START: address = 0xC000_0000;
pub const SHARED_MEM_SIZE_MAX: address = 96 << 10;
pub const LOCAL_MEM_SIZE_MAX: address = 1 << 14;
pub const MAX_STREAMING_MULTIPROCESSORS: address = 80;
pub const MAX_THREAD_PER_SM: address = 1 << 11;
pub const TOTAL_LOCAL_MEM_PER_SM: address = MAX_THREAD_PER_SM * LOCAL_MEM_SIZE_MAX;
pub const TOTAL_SHARED_MEM: address = MAX_STREAMING_MULTIPROCESSORS * SHARED_MEM_SIZE_MAX;
pub const TOTAL_LOCAL_MEM: address =
    MAX_STREAMING_MULTIPROCESSORS * MAX_THREAD_PER_SM * LOCAL_MEM_SIZE_MAX;
pub const SHARED_GENERIC_START: address = GLOBAL_HEAP_START - TOTAL_SHARED_MEM;
pub const LOCAL_GENERIC_START: address = SHARED_GENERIC_START - TOTAL_LOCAL_MEM;

impl MemorySpace {
    #[must_use]
    pub fn base_addr(self) -> address {
        match self {
            Self::Local => LOCAL_GENERIC_START,
            Self::Shared => SHARED_GENERIC_START,
            Self::Constant | Self::Texture | Self::Global => GLOBAL_HEAP_START,
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum CacheOperator {
    /// Cache at all levels.
    ALL,
    /// Cache at L2 only, bypassing the per-core data cache.
    GLOBAL,
    /// Cache at L1 and L2.
    L1,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct BarrierInfo {
    pub id: usize,
}

/// One decoded instruction flowing through the pipeline.
///
/// Produced by the functional engine at decode; immutable once issued
/// except for the access queue drained by the load store unit and the
/// destination slots cleared by register file writeback.
#[derive(Clone)]
pub struct WarpInstruction {
    /// Globally unique issue id, assigned when the instruction issues.
    pub uid: u64,
    pub warp_id: usize,
    pub scheduler_id: Option<usize>,
    pub pc: address,
    /// Encoded size in bytes; the fetch offset to the next instruction.
    pub isize: u32,
    pub opcode: Opcode,
    pub active_mask: ActiveMask,
    /// Divergence stack height this instruction was fetched at.
    pub height: usize,
    pub memory_space: Option<MemorySpace>,
    pub cache_operator: CacheOperator,
    pub is_atomic: bool,
    pub barrier: Option<BarrierInfo>,
    pub outputs: [Option<u32>; MAX_OUTPUT_REGS],
    pub inputs: [Option<u32>; MAX_INPUT_REGS],
    /// Cycles until the result is available.
    pub latency: usize,
    pub initiation_interval: usize,
    /// Cycles the instruction stays in the dispatch register before
    /// entering its unit's pipeline.
    pub dispatch_delay_cycles: usize,
    pub issue_cycle: Option<u64>,
    pub data_size: u32,
    pub mem_access_queue: VecDeque<MemAccess>,
}

impl WarpInstruction {
    #[must_use]
    pub fn new(opcode: Opcode, pc: address) -> Self {
        Self {
            uid: 0,
            warp_id: 0,
            scheduler_id: None,
            pc,
            isize: 8,
            opcode,
            active_mask: ActiveMask::ZERO,
            height: 0,
            memory_space: None,
            cache_operator: CacheOperator::ALL,
            is_atomic: false,
            barrier: None,
            outputs: [None; MAX_OUTPUT_REGS],
            inputs: [None; MAX_INPUT_REGS],
            latency: 1,
            initiation_interval: 1,
            dispatch_delay_cycles: 0,
            issue_cycle: None,
            data_size: 4,
            mem_access_queue: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn is_load(&self) -> bool {
        self.opcode.category == ArchOp::LOAD_OP
    }

    #[must_use]
    pub fn is_store(&self) -> bool {
        self.opcode.category == ArchOp::STORE_OP
    }

    #[must_use]
    pub fn is_memory_barrier(&self) -> bool {
        self.opcode.category == ArchOp::MEMORY_BARRIER_OP
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_mask.count_ones()
    }

    /// Issue group identity for unique warp pipe width accounting.
    ///
    /// Instructions that have not issued yet map to a sentinel cycle so
    /// they never alias a resident issue group.
    #[must_use]
    pub fn unique_key(&self) -> UniqueWarpKey {
        (self.warp_id, self.issue_cycle.unwrap_or(u64::MAX))
    }

    pub fn dest_regs(&self) -> impl Iterator<Item = u32> + '_ {
        self.outputs.iter().copied().flatten()
    }

    pub fn src_regs(&self) -> impl Iterator<Item = u32> + '_ {
        self.inputs.iter().copied().flatten()
    }

    /// All architectural registers this instruction touches.
    #[must_use]
    pub fn registers(&self) -> SmallVec<[u32; 8]> {
        self.dest_regs().chain(self.src_regs()).collect()
    }

    #[must_use]
    pub fn accessq_count(&self) -> usize {
        self.mem_access_queue.len()
    }
}

impl std::fmt::Display for WarpInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}[pc={},warp={},h={}]",
            self.opcode, self.pc, self.warp_id, self.height
        )
    }
}

impl std::fmt::Debug for WarpInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WarpInstruction")
            .field("uid", &self.uid)
            .field("opcode", &self.opcode)
            .field("warp_id", &self.warp_id)
            .field("pc", &self.pc)
            .field("height", &self.height)
            .field("active_mask", &self.active_mask)
            .field("issue_cycle", &self.issue_cycle)
            .finish()
    }
}

impl PartialEq for WarpInstruction {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for WarpInstruction {}

impl PartialOrd for WarpInstruction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WarpInstruction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.uid.cmp(&other.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ArchOp, Op};
    use bitvec::array::BitArray;

    fn add(warp_id: usize, out: u32, in1: u32, in2: u32) -> WarpInstruction {
        let mut instr = WarpInstruction::new(
            Opcode {
                op: Op::IADD,
                category: ArchOp::INT_OP,
            },
            0x100,
        );
        instr.warp_id = warp_id;
        instr.outputs[0] = Some(out);
        instr.inputs[0] = Some(in1);
        instr.inputs[1] = Some(in2);
        instr
    }

    #[test]
    fn test_register_collection() {
        let instr = add(3, 10, 11, 12);
        let mut regs = instr.registers().to_vec();
        regs.sort_unstable();
        assert_eq!(regs, vec![10, 11, 12]);
    }

    #[test]
    fn test_unique_key_sentinel() {
        let mut instr = add(3, 10, 11, 12);
        assert_eq!(instr.unique_key(), (3, u64::MAX));
        instr.issue_cycle = Some(42);
        assert_eq!(instr.unique_key(), (3, 42));
    }

    #[test]
    fn test_active_count() {
        let mut instr = add(0, 1, 2, 3);
        instr.active_mask = BitArray::ZERO;
        instr.active_mask[..16].fill(true);
        assert_eq!(instr.active_count(), 16);
    }
}
