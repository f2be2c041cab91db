use crate::sync::Arc;
use crate::{
    config, core::Core, engine,
    interconn::{Interconnect, Packet},
    mem_fetch::{self, MemFetch},
};
use color_eyre::eyre;
use std::collections::VecDeque;

/// A group of cores sharing one interconnect port.
///
/// Responses ejected from the network land in a bounded buffer and are
/// routed to the owning core's instruction fetch or load store unit; a
/// full core applies backpressure by leaving the response at the buffer
/// head.
pub struct Cluster<I> {
    pub cluster_id: usize,
    pub cores: Vec<Core<I>>,
    response_fifo: VecDeque<MemFetch>,
    interconn: Arc<I>,
    config: Arc<config::GPU>,
    block_issue_next_core: usize,
}

impl<I> Cluster<I>
where
    I: Interconnect<Packet<MemFetch>> + 'static,
{
    #[must_use]
    pub fn new(
        cluster_id: usize,
        config: Arc<config::GPU>,
        interconn: Arc<I>,
        engine: engine::Ref,
    ) -> Self {
        let cores = (0..config.num_cores_per_cluster)
            .map(|core_id| {
                Core::new(
                    core_id,
                    cluster_id,
                    Arc::clone(&config),
                    Arc::clone(&interconn),
                    Arc::clone(&engine),
                )
            })
            .collect();
        Self {
            cluster_id,
            cores,
            response_fifo: VecDeque::new(),
            interconn,
            config,
            block_issue_next_core: 0,
        }
    }

    #[must_use]
    pub fn num_active_blocks(&self) -> usize {
        self.cores.iter().map(Core::num_active_blocks).sum()
    }

    /// Launch a block on the next core with room, round robin.
    pub fn issue_block(
        &mut self,
        block_id: u64,
        start_pc: crate::address,
        num_threads: usize,
    ) -> eyre::Result<()> {
        let num_cores = self.cores.len();
        for i in 0..num_cores {
            let core_id = (self.block_issue_next_core + i) % num_cores;
            if self.cores[core_id].can_issue_block() {
                self.cores[core_id].issue_block(block_id, start_pc, num_threads)?;
                self.block_issue_next_core = (core_id + 1) % num_cores;
                return Ok(());
            }
        }
        eyre::bail!("cluster {}: no core can accept block {block_id}", self.cluster_id)
    }

    /// Move responses from the interconnect towards their cores.
    #[tracing::instrument(skip_all)]
    pub fn interconn_cycle(&mut self, cycle: u64) {
        if let Some(fetch) = self.response_fifo.front() {
            let core_id = self.config.global_core_id_to_core_id(fetch.core_id);
            let is_fetch_response = fetch.access_kind() == mem_fetch::access::Kind::INST_ACC_R;
            let core = &mut self.cores[core_id];
            if is_fetch_response {
                if !core.fetch_unit_response_buffer_full() {
                    let Some(mut fetch) = self.response_fifo.pop_front() else {
                        return;
                    };
                    fetch.status = mem_fetch::Status::IN_CLUSTER_TO_SHADER_QUEUE;
                    core.accept_fetch_response(fetch, cycle);
                }
            } else if !core.ldst_unit_response_buffer_full() {
                let Some(fetch) = self.response_fifo.pop_front() else {
                    return;
                };
                log::debug!("cluster {}: ldst response {}", self.cluster_id, fetch);
                core.accept_ldst_unit_response(fetch);
            }
        }

        if self.response_fifo.len() >= self.config.ejection_buffer_size {
            return;
        }
        if let Some(Packet { mut data, .. }) = self.interconn.pop(self.cluster_id) {
            data.status = mem_fetch::Status::IN_CLUSTER_TO_SHADER_QUEUE;
            self.response_fifo.push_back(data);
        }
    }

    #[tracing::instrument(skip_all)]
    pub fn cycle(&mut self, cycle: u64) -> eyre::Result<()> {
        self.interconn_cycle(cycle);
        for core in &mut self.cores {
            core.cycle(cycle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FunctionalEngine, TableEngine};
    use crate::interconn::ToyInterconnect;
    use crate::mem_fetch::access::{Kind, MemAccess};
    use crate::sync::Mutex;

    fn test_cluster() -> (
        Cluster<ToyInterconnect<Packet<MemFetch>>>,
        Arc<ToyInterconnect<Packet<MemFetch>>>,
    ) {
        let config = Arc::new(config::GPU::default());
        let interconn = Arc::new(ToyInterconnect::new(
            config.num_clusters,
            config.num_mem_partitions,
        ));
        let engine: Box<dyn FunctionalEngine> = Box::new(TableEngine::new());
        let cluster = Cluster::new(
            0,
            config,
            Arc::clone(&interconn),
            Arc::new(Mutex::new(engine)),
        );
        (cluster, interconn)
    }

    #[test]
    fn test_fetch_responses_route_to_the_instruction_cache() {
        let (mut cluster, interconn) = test_cluster();

        let mut fetch = MemFetch::new(
            1,
            MemAccess::new(Kind::INST_ACC_R, 0x80, 128),
            None,
            0,
            0,
            0,
        );
        fetch.set_reply();
        interconn.push(1, 0, Packet { data: fetch, time: 0 }, 8);

        // one cycle to eject, one to hand the response to the core
        cluster.interconn_cycle(0);
        cluster.interconn_cycle(1);

        assert!(cluster.cores[0].instr_l1.access_ready());
        assert!(cluster.response_fifo.is_empty());
    }

    #[test]
    fn test_blocks_round_robin_over_cores() {
        let (mut cluster, _interconn) = test_cluster();
        cluster.issue_block(0, 0x0, 32).unwrap();
        assert_eq!(cluster.num_active_blocks(), 1);
        // single-core default config wraps back to core 0
        cluster.issue_block(1, 0x0, 32).unwrap();
        assert_eq!(cluster.num_active_blocks(), 2);
    }
}
