use crate::{core::PipelineStage, scheduler, MAX_WARP_FRAGMENTS};
use serde::Deserialize;

pub const MAX_WARPS_PER_CORE: usize = 64;

/// How per-thread local memory is laid out in the global address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LocalMemoryMap {
    /// Threads of all cores interleaved with padding to the maximum
    /// thread count, giving a stable mapping across launches.
    Padded,
    /// Each core's threads packed contiguously.
    PerCoreContiguous,
}

/// Configuration surface of the shader core model, read-only after
/// construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GPU {
    pub warp_size: usize,
    pub max_warps_per_core: usize,
    pub max_blocks_per_core: usize,
    pub max_threads_per_core: usize,

    pub num_schedulers_per_core: usize,
    pub scheduler: scheduler::Kind,
    /// Active subset size of the two-level scheduler.
    pub two_level_max_active_warps: usize,
    /// Candidate-set cap of the warp-limiting scheduler.
    pub warp_limit: usize,
    /// Distinct fragments of one warp that may issue as one group.
    pub max_warp_fragments: usize,
    /// Offer every valid stack level for fetch, not only the top.
    pub multi_exec: bool,
    /// Skip warps with an outstanding instruction-cache miss at issue.
    pub imiss_issue_check: bool,

    /// Slots per pipeline register stage, indexed by [`PipelineStage`].
    pub pipeline_widths: Vec<usize>,

    pub num_reg_banks: usize,
    /// Offset the bank index by the warp id.
    pub reg_bank_warp_shift: bool,
    /// Satisfy identical register reads of sibling fragments with one
    /// bank grant.
    pub operand_collector_broadcast: bool,
    /// Dispatch a collector unit only when all resident fragments of its
    /// issue group are ready.
    pub operand_collector_wait_all_fragments: bool,
    /// Lanes per register-file activity group for clock-gated
    /// accounting; `None` charges a full warp per operand.
    pub regfile_gating_group: Option<usize>,

    pub num_collector_units_sp: usize,
    pub num_collector_units_sfu: usize,
    pub num_collector_units_mem: usize,
    pub num_dispatch_units_sp: usize,
    pub num_dispatch_units_sfu: usize,
    pub num_dispatch_units_mem: usize,
    /// Operand-collector steps per core cycle.
    pub reg_file_port_throughput: usize,

    pub num_sp_units: usize,
    pub num_sfu_units: usize,
    pub max_sp_latency: usize,
    pub max_sfu_latency: usize,
    pub shared_memory_latency: usize,

    pub num_clusters: usize,
    pub num_cores_per_cluster: usize,
    pub num_mem_partitions: usize,
    /// Capacity of a cluster's interconnect ejection buffer.
    pub ejection_buffer_size: usize,
    /// Capacity of the load store unit's response queue.
    pub ldst_response_buffer_size: usize,

    /// Global and local accesses bypass the per-core data cache.
    pub gmem_skip_l1d: bool,
    pub local_mem_map: LocalMemoryMap,
}

impl Default for GPU {
    fn default() -> Self {
        Self {
            warp_size: crate::warp::WARP_SIZE,
            max_warps_per_core: MAX_WARPS_PER_CORE,
            max_blocks_per_core: 8,
            max_threads_per_core: 2048,
            num_schedulers_per_core: 2,
            scheduler: scheduler::Kind::Gto,
            two_level_max_active_warps: 8,
            warp_limit: 6,
            max_warp_fragments: MAX_WARP_FRAGMENTS,
            multi_exec: true,
            imiss_issue_check: true,
            pipeline_widths: vec![4; 7],
            num_reg_banks: 16,
            reg_bank_warp_shift: true,
            operand_collector_broadcast: true,
            operand_collector_wait_all_fragments: false,
            regfile_gating_group: None,
            num_collector_units_sp: 4,
            num_collector_units_sfu: 4,
            num_collector_units_mem: 2,
            num_dispatch_units_sp: 1,
            num_dispatch_units_sfu: 1,
            num_dispatch_units_mem: 1,
            reg_file_port_throughput: 1,
            num_sp_units: 1,
            num_sfu_units: 1,
            max_sp_latency: 13,
            max_sfu_latency: 21,
            shared_memory_latency: 3,
            num_clusters: 1,
            num_cores_per_cluster: 1,
            num_mem_partitions: 1,
            ejection_buffer_size: 8,
            ldst_response_buffer_size: 2,
            gmem_skip_l1d: false,
            local_mem_map: LocalMemoryMap::Padded,
        }
    }
}

impl GPU {
    #[must_use]
    pub fn pipe_width(&self, stage: PipelineStage) -> usize {
        self.pipeline_widths
            .get(stage as usize)
            .copied()
            .unwrap_or(1)
    }

    /// Distinct issue groups a stage of `width` slots admits per cycle.
    #[must_use]
    pub fn max_unique_warps(&self, width: usize) -> usize {
        (width / self.max_warp_fragments).max(1)
    }

    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.num_clusters * self.num_cores_per_cluster
    }

    #[must_use]
    pub fn global_core_id(&self, cluster_id: usize, core_id: usize) -> usize {
        cluster_id * self.num_cores_per_cluster + core_id
    }

    #[must_use]
    pub fn global_core_id_to_core_id(&self, global_core_id: usize) -> usize {
        global_core_id % self.num_cores_per_cluster
    }

    /// Interconnect node id of a memory partition.
    #[must_use]
    pub fn mem_device(&self, partition_id: usize) -> usize {
        self.num_clusters + partition_id
    }
}

#[cfg(test)]
mod tests {
    use super::GPU;
    use crate::core::PipelineStage;

    #[test]
    fn test_unique_warp_caps() {
        let config = GPU::default();
        assert_eq!(config.max_unique_warps(4), 2);
        assert_eq!(config.max_unique_warps(2), 1);
        // never zero, even for a single-slot stage
        assert_eq!(config.max_unique_warps(1), 1);
    }

    #[test]
    fn test_pipe_width_defaults() {
        let config = GPU::default();
        assert_eq!(config.pipe_width(PipelineStage::ID_OC_SP), 4);
        assert_eq!(config.pipe_width(PipelineStage::EX_WB), 4);
    }
}
