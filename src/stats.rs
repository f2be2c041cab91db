use std::collections::HashMap;

use crate::func_unit::load_store::{MemStageAccessKind, MemStageStallKind};

/// Cycle-granular issue outcome counters, kept per scheduler instance.
///
/// Exactly one bucket advances per scheduler per cycle: no valid
/// buffered instruction counts as idle / control hazard, a valid
/// instruction blocked by the scoreboard as a data hazard, and a ready
/// instruction blocked only by stage occupancy as a structural stall.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub num_issued: u64,
    pub issue_idle_or_control_stall: u64,
    pub issue_raw_hazard_stall: u64,
    pub issue_pipeline_stall: u64,
    /// Buffered instructions discarded because their PC disagreed with
    /// the divergence stack.
    pub control_hazard_flushes: u64,
}

#[derive(Debug, Default, Clone)]
pub struct CoreStats {
    pub cycles: u64,
    pub instructions_issued: u64,
    pub instructions_completed: u64,
    pub thread_instructions_executed: u64,
    pub warps_retired: u64,
    pub blocks_retired: u64,
    /// Register file bank activity; reads are lane-aggregated when
    /// clock-gated accounting is enabled.
    pub regfile_bank_reads: u64,
    pub regfile_bank_writes: u64,
    pub num_mem_stage_stalls: u64,
    pub mem_stage_stall_breakdown: HashMap<(MemStageAccessKind, MemStageStallKind), u64>,
}

impl CoreStats {
    pub fn record_mem_stage_stall(&mut self, kind: MemStageAccessKind, stall: MemStageStallKind) {
        self.num_mem_stage_stalls += 1;
        *self.mem_stage_stall_breakdown.entry((kind, stall)).or_default() += 1;
    }
}
