use crate::sync::{atomic, Arc, Mutex, RwLock};
use crate::{
    address, barrier,
    cache::{Cache, PerfectCache, RequestStatus},
    config, engine,
    func_unit::{
        LoadStoreUnit, OccupiedSlots, SPUnit, SfuUnit, SimdFunctionUnit, MAX_ALU_LATENCY,
    },
    instruction::{self, WarpInstruction},
    interconn::{Interconnect, Packet},
    mem_fetch::{access, MemFetch},
    opcodes::ArchOp,
    operand_collector::{self, RegisterFileUnit, Writeback},
    register_set::{self, RegisterSet},
    scheduler, scoreboard, simt, stats,
    warp::{self, ActiveMask, Warp},
    UniqueWarpKey,
};
use color_eyre::eyre;
use console::style;
use crossbeam::utils::CachePadded;
use std::collections::HashMap;
use strum::IntoEnumIterator;

/// Pipeline register stages of one shader core, in pipeline order.
///
/// The numeric value indexes the per-stage width configuration and the
/// core's pipeline register array.
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumIter,
    strum::EnumCount,
    strum::FromRepr,
    strum::AsRefStr,
)]
#[repr(usize)]
pub enum PipelineStage {
    ID_OC_SP = 0,
    ID_OC_SFU,
    ID_OC_MEM,
    OC_EX_SP,
    OC_EX_SFU,
    OC_EX_MEM,
    EX_WB,
}

/// Issue-side services the core offers its schedulers.
///
/// Schedulers own the ordering decision; everything that touches core
/// state (pipeline stages, divergence stacks, barriers, the actual move
/// of an instruction out of the instruction buffer) goes through this
/// trait.
pub trait WarpIssuer {
    /// Whether `stage` can admit an instruction of issue group `key`
    /// under the unique warp width cap.
    fn stage_can_accept(&self, stage: PipelineStage, key: UniqueWarpKey) -> bool;

    /// Move the instruction buffered in `slot` into `stage`, updating
    /// divergence, scoreboard and barrier state.
    fn issue_warp(
        &mut self,
        stage: PipelineStage,
        warp: &mut Warp,
        slot: usize,
        scheduler_id: usize,
        cycle: u64,
    ) -> eyre::Result<()>;

    fn warp_waiting_at_barrier(&self, warp_id: usize) -> bool;

    /// Memory barriers drain once the warp has no outstanding stores;
    /// clears the wait flag as a side effect when satisfied.
    fn warp_waiting_at_mem_barrier(&self, warp: &mut Warp) -> bool;

    fn pdom_entry(&self, warp_id: usize, height: usize) -> Option<simt::PdomEntry>;

    fn active_mask(&self, warp_id: usize, height: usize) -> ActiveMask;
}

/// A fetched fragment waiting for decode.
#[derive(Debug, Clone, Copy)]
struct FetchedFragment {
    warp_id: usize,
    height: usize,
    pc: address,
}

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("block {block_id} needs {needed} warp slots, only {available} free")]
    NoFreeWarpSlots {
        block_id: u64,
        needed: usize,
        available: usize,
    },
}

/// Core state shared between the schedulers and the pipeline stages.
pub struct CoreIssuer {
    pub core_id: usize,
    pub cluster_id: usize,
    pub config: Arc<config::GPU>,
    pub warps: Vec<warp::Ref>,
    pub stacks: Vec<simt::Ref>,
    pub scoreboard: Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>>,
    pub barriers: barrier::BarrierSet,
    /// Indexed by [`PipelineStage`].
    pub pipeline_reg: Vec<register_set::Ref>,
    pub engine: engine::Ref,
    pub stats: Arc<Mutex<stats::CoreStats>>,
    instr_uid: Arc<CachePadded<atomic::AtomicU64>>,
}

impl CoreIssuer {
    /// Retirement bookkeeping shared by the ALU writeback stage and the
    /// load store unit.
    pub fn warp_inst_complete(&mut self, instr: &WarpInstruction) {
        {
            let mut stats = self.stats.try_lock();
            stats.instructions_completed += 1;
            stats.thread_instructions_executed += instr.active_count() as u64;
        }
        let mut warp = self.warps[instr.warp_id].try_lock();
        debug_assert!(warp.num_instr_in_pipeline > 0);
        warp.num_instr_in_pipeline -= 1;
        if instr.is_atomic {
            warp.num_outstanding_atomics = warp.num_outstanding_atomics.saturating_sub(1);
        }
        if instr.opcode.category == ArchOp::EXIT_OPS {
            warp.num_active_threads = warp.num_active_threads.saturating_sub(instr.active_count());
            if warp.functional_done() && !warp.done_exit() {
                warp.done_exit = true;
                let warp_id = warp.warp_id;
                drop(warp);
                self.barriers.warp_exited(warp_id);
                self.stats.try_lock().warps_retired += 1;
            }
        }
    }
}

impl WarpIssuer for CoreIssuer {
    fn stage_can_accept(&self, stage: PipelineStage, key: UniqueWarpKey) -> bool {
        let set = self.pipeline_reg[stage as usize].try_lock();
        let max_unique = self.config.max_unique_warps(set.size());
        set.can_accept(key, max_unique)
    }

    fn issue_warp(
        &mut self,
        stage: PipelineStage,
        warp: &mut Warp,
        slot: usize,
        scheduler_id: usize,
        cycle: u64,
    ) -> eyre::Result<()> {
        let Some(entry) = warp.ibuffer_take(slot) else {
            eyre::bail!(
                "issue from warp {} slot {} without a buffered instruction",
                warp.warp_id,
                slot
            );
        };
        let height = entry.height;
        let mut instr = entry.instr;
        instr.uid = self.instr_uid.fetch_add(1, atomic::Ordering::SeqCst);
        instr.warp_id = warp.warp_id;
        instr.scheduler_id = Some(scheduler_id);
        instr.issue_cycle = Some(cycle);
        instr.height = height;

        let removed = {
            let mut stack = self.stacks[warp.warp_id].try_lock();
            instr.active_mask = stack.active_mask(height);
            self.engine.try_lock().execute(&mut instr);
            stack.update(&instr)
        };
        if removed > 0 {
            if height == 0 && removed == 1 {
                // the base level left the stack: the warp is exiting,
                // so anything still buffered is dead
                warp.flush_fragments();
            } else {
                // buffered fragments keep pointing at their stack levels
                warp.renumber_heights(height, removed);
            }
        }

        match instr.opcode.category {
            ArchOp::BARRIER_OP => {
                self.barriers.warp_reached_barrier(warp.block_id, warp.warp_id);
            }
            ArchOp::MEMORY_BARRIER_OP => {
                warp.waiting_for_memory_barrier = true;
            }
            _ => {}
        }
        if instr.is_atomic {
            warp.num_outstanding_atomics += 1;
        }

        self.scoreboard.try_write().reserve_all(&instr);
        warp.num_instr_in_pipeline += 1;
        self.stats.try_lock().instructions_issued += 1;

        log::trace!(
            "cycle {:02} core {}: issued {} at height {} -> {:?}",
            cycle,
            self.core_id,
            instr,
            height,
            stage
        );
        self.pipeline_reg[stage as usize]
            .try_lock()
            .move_in_from(Some(instr));
        Ok(())
    }

    fn warp_waiting_at_barrier(&self, warp_id: usize) -> bool {
        self.barriers.is_waiting_at_barrier(warp_id)
    }

    fn warp_waiting_at_mem_barrier(&self, warp: &mut Warp) -> bool {
        if !warp.waiting_for_memory_barrier {
            return false;
        }
        if warp.num_outstanding_stores == 0 {
            warp.waiting_for_memory_barrier = false;
            false
        } else {
            true
        }
    }

    fn pdom_entry(&self, warp_id: usize, height: usize) -> Option<simt::PdomEntry> {
        self.stacks[warp_id].try_lock().pdom_entry(height)
    }

    fn active_mask(&self, warp_id: usize, height: usize) -> ActiveMask {
        self.stacks[warp_id].try_lock().active_mask(height)
    }
}

/// One streaming multiprocessor.
///
/// Advances in reverse pipeline order each cycle so a stage never
/// observes a value produced earlier in the same cycle.
pub struct Core<I> {
    pub issuer: CoreIssuer,
    pub schedulers: Vec<scheduler::Base>,
    scheduler_issue_priority: usize,
    pub instr_l1: Box<dyn Cache>,
    fetch_buffer: Option<FetchedFragment>,
    last_warp_fetched: usize,
    pub operand_collector: operand_collector::Ref,
    functional_units: Vec<Box<dyn SimdFunctionUnit>>,
    pub load_store_unit: LoadStoreUnit<I>,
    result_busses: Vec<OccupiedSlots>,
    block_warps: HashMap<u64, Vec<usize>>,
    dynamic_warp_id: usize,
    fetch_uid: u64,
}

impl<I> Core<I>
where
    I: Interconnect<Packet<MemFetch>> + 'static,
{
    #[must_use]
    pub fn new(
        core_id: usize,
        cluster_id: usize,
        config: Arc<config::GPU>,
        interconn: Arc<I>,
        engine: engine::Ref,
    ) -> Self {
        let warps: Vec<warp::Ref> = (0..config.max_warps_per_core)
            .map(|id| Arc::new(Mutex::new(Warp::new(id))))
            .collect();
        let stacks: Vec<simt::Ref> = (0..config.max_warps_per_core)
            .map(|_| {
                let stack: Box<dyn simt::Stack> = Box::<simt::FlatStack>::default();
                Arc::new(Mutex::new(stack))
            })
            .collect();
        let scoreboard: Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>> =
            Arc::new(RwLock::new(scoreboard::Scoreboard::new(
                cluster_id,
                core_id,
                config.max_warps_per_core,
            )));
        let stats = Arc::new(Mutex::new(stats::CoreStats::default()));

        let pipeline_reg: Vec<register_set::Ref> = PipelineStage::iter()
            .map(|stage| {
                Arc::new(Mutex::new(RegisterSet::new(
                    stage,
                    config.pipe_width(stage),
                    stage as usize,
                )))
            })
            .collect();

        let operand_collector = Self::build_operand_collector(&config, &pipeline_reg);

        let mut schedulers = Vec::new();
        for scheduler_id in 0..config.num_schedulers_per_core {
            let supervised: Vec<warp::Ref> = warps
                .iter()
                .enumerate()
                .filter(|(warp_id, _)| warp_id % config.num_schedulers_per_core == scheduler_id)
                .map(|(_, warp_ref)| Arc::clone(warp_ref))
                .collect();
            schedulers.push(scheduler::Base::new(
                scheduler_id,
                cluster_id,
                core_id,
                supervised,
                Arc::clone(&scoreboard),
                config.scheduler.build(&config),
                Arc::clone(&config),
            ));
        }

        let ex_wb = Arc::clone(&pipeline_reg[PipelineStage::EX_WB as usize]);
        let mut functional_units: Vec<Box<dyn SimdFunctionUnit>> = Vec::new();
        for id in 0..config.num_sp_units {
            functional_units.push(Box::new(SPUnit::new(
                id,
                Arc::clone(&ex_wb),
                Arc::clone(&config),
            )));
        }
        for id in 0..config.num_sfu_units {
            functional_units.push(Box::new(SfuUnit::new(
                id,
                Arc::clone(&ex_wb),
                Arc::clone(&config),
            )));
        }
        let load_store_unit = LoadStoreUnit::new(
            0,
            core_id,
            cluster_id,
            warps.clone(),
            interconn,
            Arc::clone(&operand_collector),
            Arc::clone(&scoreboard),
            Arc::clone(&config),
            Arc::clone(&stats),
        );

        let result_busses = vec![OccupiedSlots::ZERO; config.pipe_width(PipelineStage::EX_WB)];

        let issuer = CoreIssuer {
            core_id,
            cluster_id,
            barriers: barrier::BarrierSet::new(config.max_blocks_per_core),
            warps,
            stacks,
            scoreboard,
            pipeline_reg,
            engine,
            stats,
            instr_uid: Arc::new(CachePadded::new(atomic::AtomicU64::new(0))),
            config,
        };

        Self {
            issuer,
            schedulers,
            scheduler_issue_priority: 0,
            instr_l1: Box::<PerfectCache>::default(),
            fetch_buffer: None,
            last_warp_fetched: 0,
            operand_collector,
            functional_units,
            load_store_unit,
            result_busses,
            block_warps: HashMap::new(),
            dynamic_warp_id: 0,
            fetch_uid: 0,
        }
    }

    fn build_operand_collector(
        config: &Arc<config::GPU>,
        pipeline_reg: &[register_set::Ref],
    ) -> operand_collector::Ref {
        use operand_collector::Kind;
        let mut collector = RegisterFileUnit::new(Arc::clone(config));
        collector.add_cu_set(
            Kind::SP_CUS,
            config.num_collector_units_sp,
            config.num_dispatch_units_sp,
        );
        collector.add_cu_set(
            Kind::SFU_CUS,
            config.num_collector_units_sfu,
            config.num_dispatch_units_sfu,
        );
        collector.add_cu_set(
            Kind::MEM_CUS,
            config.num_collector_units_mem,
            config.num_dispatch_units_mem,
        );
        collector.add_port(
            vec![PipelineStage::ID_OC_SP],
            vec![PipelineStage::OC_EX_SP],
            vec![Kind::SP_CUS],
        );
        collector.add_port(
            vec![PipelineStage::ID_OC_SFU],
            vec![PipelineStage::OC_EX_SFU],
            vec![Kind::SFU_CUS],
        );
        collector.add_port(
            vec![PipelineStage::ID_OC_MEM],
            vec![PipelineStage::OC_EX_MEM],
            vec![Kind::MEM_CUS],
        );
        let stages: HashMap<PipelineStage, register_set::Ref> = PipelineStage::iter()
            .map(|stage| (stage, Arc::clone(&pipeline_reg[stage as usize])))
            .collect();
        collector.init(stages);
        Arc::new(Mutex::new(collector))
    }

    // block scheduling

    #[must_use]
    pub fn can_issue_block(&self) -> bool {
        self.issuer.barriers.num_blocks() < self.issuer.config.max_blocks_per_core
    }

    #[must_use]
    pub fn num_active_blocks(&self) -> usize {
        self.block_warps.len()
    }

    /// Launch a block of `num_threads` threads at `start_pc`, claiming
    /// contiguous free warp slots.
    pub fn issue_block(
        &mut self,
        block_id: u64,
        start_pc: address,
        num_threads: usize,
    ) -> Result<(), LaunchError> {
        let warp_size = self.issuer.config.warp_size;
        let num_warps = num_threads.div_ceil(warp_size);
        let free_slots: Vec<usize> = (0..self.issuer.warps.len())
            .filter(|&warp_id| {
                let warp = self.issuer.warps[warp_id].try_lock();
                warp.done_exit() && warp.hardware_done()
            })
            .take(num_warps)
            .collect();
        if free_slots.len() < num_warps {
            return Err(LaunchError::NoFreeWarpSlots {
                block_id,
                needed: num_warps,
                available: free_slots.len(),
            });
        }

        let mut block_mask = barrier::WarpMask::ZERO;
        for &warp_id in &free_slots {
            block_mask.set(warp_id, true);
        }
        self.issuer.barriers.allocate(block_id, block_mask);

        let mut remaining = num_threads;
        for &warp_id in &free_slots {
            let lanes = remaining.min(warp_size);
            remaining -= lanes;
            let mut lane_mask = ActiveMask::ZERO;
            lane_mask[..lanes].fill(true);

            self.issuer.stacks[warp_id]
                .try_lock()
                .launch(start_pc, lane_mask);
            self.issuer.warps[warp_id].try_lock().init(
                block_id,
                self.dynamic_warp_id,
                start_pc,
                lane_mask,
            );
            self.dynamic_warp_id += 1;
        }
        log::debug!(
            "{}",
            style(format!(
                "core {}: issued block {block_id} over warps {free_slots:?}",
                self.issuer.core_id
            ))
            .green()
        );
        self.block_warps.insert(block_id, free_slots);
        Ok(())
    }

    fn retire_finished_blocks(&mut self) {
        let finished: Vec<u64> = self
            .block_warps
            .iter()
            .filter(|(_, warp_ids)| {
                warp_ids.iter().all(|&warp_id| {
                    let warp = self.issuer.warps[warp_id].try_lock();
                    warp.done_exit() && warp.hardware_done()
                })
            })
            .map(|(&block_id, _)| block_id)
            .collect();
        for block_id in finished {
            let Some(warp_ids) = self.block_warps.remove(&block_id) else {
                continue;
            };
            self.issuer.barriers.deallocate(block_id);
            for warp_id in warp_ids {
                self.issuer.warps[warp_id].try_lock().reset();
            }
            self.issuer.stats.try_lock().blocks_retired += 1;
        }
    }

    /// Global address of a thread's slice of local memory.
    #[must_use]
    pub fn translate_local_memaddr(&self, local_addr: address, thread_id: usize) -> address {
        let config = &self.issuer.config;
        let global_core_id =
            config.global_core_id(self.issuer.cluster_id, self.issuer.core_id) as address;
        let slot = match config.local_mem_map {
            config::LocalMemoryMap::Padded => {
                // stable across launches: every core padded to the
                // architectural thread limit
                global_core_id * instruction::MAX_THREAD_PER_SM + thread_id as address
            }
            config::LocalMemoryMap::PerCoreContiguous => {
                global_core_id * config.max_threads_per_core as address + thread_id as address
            }
        };
        instruction::LOCAL_GENERIC_START + slot * instruction::LOCAL_MEM_SIZE_MAX + local_addr
    }

    // cluster-facing response plumbing

    #[must_use]
    pub fn ldst_unit_response_buffer_full(&self) -> bool {
        self.load_store_unit.response_buffer_full()
    }

    pub fn accept_ldst_unit_response(&mut self, fetch: MemFetch) {
        self.load_store_unit.fill(fetch);
    }

    #[must_use]
    pub fn fetch_unit_response_buffer_full(&self) -> bool {
        false
    }

    pub fn accept_fetch_response(&mut self, fetch: MemFetch, time: u64) {
        self.instr_l1.fill(fetch, time);
    }

    // pipeline stages

    fn writeback(&mut self, _cycle: u64) {
        let ex_wb = Arc::clone(&self.issuer.pipeline_reg[PipelineStage::EX_WB as usize]);
        loop {
            let instr = {
                let mut set = ex_wb.try_lock();
                let Some(slot) = set.get_ready_mut() else {
                    break;
                };
                let Some(instr) = slot.as_mut() else {
                    break;
                };
                // the register file clears destination slots as banks
                // are won, so snapshot them first
                let dest_regs: Vec<u32> = instr.dest_regs().collect();
                let warp_id = instr.warp_id;
                let mask = instr.active_mask;
                if !self.operand_collector.try_lock().writeback(instr) {
                    break;
                }
                let Some(instr) = slot.take() else {
                    break;
                };
                let mut sb = self.issuer.scoreboard.try_write();
                for reg in dest_regs {
                    sb.release(warp_id, reg, mask);
                }
                instr
            };
            self.issuer.warp_inst_complete(&instr);
        }
    }

    fn dispatch_to_unit(
        unit: &mut dyn SimdFunctionUnit,
        pipeline_reg: &[register_set::Ref],
        result_busses: &mut [OccupiedSlots],
    ) {
        let mut set = pipeline_reg[unit.issue_port() as usize].try_lock();
        let Some(ready) = set.get_ready() else {
            return;
        };
        if !unit.can_issue(ready) {
            return;
        }
        if unit.stallable() {
            if let Some(instr) = set.take_ready() {
                unit.issue(instr);
            }
            return;
        }
        // non stallable units must book a result bus slot up front
        let latency = ready.latency.min(MAX_ALU_LATENCY - 1);
        let Some(bus) = result_busses.iter_mut().find(|bus| !bus[latency]) else {
            return;
        };
        bus.set(latency, true);
        if let Some(instr) = set.take_ready() {
            unit.issue(instr);
        }
    }

    fn execute(&mut self, cycle: u64) {
        for bus in &mut self.result_busses {
            bus.shift_left(1);
        }
        self.load_store_unit.cycle(cycle);
        for unit in &mut self.functional_units {
            unit.cycle(cycle);
        }
        for unit in &mut self.functional_units {
            Self::dispatch_to_unit(
                unit.as_mut(),
                &self.issuer.pipeline_reg,
                &mut self.result_busses,
            );
        }
        Self::dispatch_to_unit(
            &mut self.load_store_unit,
            &self.issuer.pipeline_reg,
            &mut self.result_busses,
        );
    }

    fn issue(&mut self, cycle: u64) -> eyre::Result<()> {
        let num = self.schedulers.len();
        for i in 0..num {
            let idx = (self.scheduler_issue_priority + i) % num;
            self.schedulers[idx].cycle(&mut self.issuer, cycle)?;
        }
        self.scheduler_issue_priority = (self.scheduler_issue_priority + 1) % num;
        Ok(())
    }

    fn decode(&mut self, _cycle: u64) {
        let Some(frag) = self.fetch_buffer.take() else {
            return;
        };
        let mut warp = self.issuer.warps[frag.warp_id].try_lock();
        let engine = self.issuer.engine.try_lock();
        let mut pc = frag.pc;
        // up to two sequential instructions of one fragment per decode
        for _ in 0..warp::IBUFFER_SIZE {
            let Some(slot) = warp.ibuffer_free_slot() else {
                break;
            };
            let Some(mut instr) = engine.fetch_decoded_instruction(pc) else {
                break;
            };
            instr.warp_id = frag.warp_id;
            instr.height = frag.height;
            instr.pc = pc;
            pc += u64::from(instr.isize);
            log::trace!(
                "decode warp {}: {} into slot {}",
                frag.warp_id,
                instr,
                slot
            );
            warp.ibuffer_fill(slot, frag.height, instr);
        }
    }

    fn fetch(&mut self, cycle: u64) {
        while self.instr_l1.access_ready() {
            let Some(fetch) = self.instr_l1.next_access() else {
                break;
            };
            self.issuer.warps[fetch.warp_id].try_lock().imiss_pending = false;
        }
        if self.fetch_buffer.is_some() {
            return;
        }
        let num_warps = self.issuer.warps.len();
        for i in 0..num_warps {
            let warp_id = (self.last_warp_fetched + 1 + i) % num_warps;
            {
                let mut warp = self.issuer.warps[warp_id].try_lock();
                // a warp can drain without an exit ever reaching
                // writeback, e.g. when its last path was flushed
                if warp.hardware_done() && !warp.done_exit() {
                    warp.done_exit = true;
                    drop(warp);
                    self.issuer.barriers.warp_exited(warp_id);
                    self.issuer.stats.try_lock().warps_retired += 1;
                    continue;
                }
            }
            let mut warp = self.issuer.warps[warp_id].try_lock();
            if warp.done_exit() || warp.functional_done() || warp.imiss_pending {
                continue;
            }
            if warp.ibuffer_free_slot().is_none() {
                continue;
            }
            if warp.pending_fragments.is_empty() {
                let excluded = warp.cached_heights();
                let fragments = self.issuer.stacks[warp_id]
                    .try_lock()
                    .fragments(&excluded, self.issuer.config.multi_exec);
                warp.pending_fragments.extend(
                    fragments
                        .into_iter()
                        .map(|frag| warp::PendingFragment {
                            height: frag.height,
                            pc: frag.pc,
                        }),
                );
            }
            let Some(frag) = warp.pending_fragments.pop_front() else {
                continue;
            };

            let access = access::MemAccess::new(access::Kind::INST_ACC_R, frag.pc, 128);
            let fetch = MemFetch::new(
                self.fetch_uid,
                access,
                None,
                warp_id,
                self.issuer.core_id,
                self.issuer.cluster_id,
            );
            self.fetch_uid += 1;
            let mut events = Vec::new();
            match self.instr_l1.access(frag.pc, fetch, &mut events, cycle) {
                RequestStatus::HIT => {
                    self.fetch_buffer = Some(FetchedFragment {
                        warp_id,
                        height: frag.height,
                        pc: frag.pc,
                    });
                }
                RequestStatus::MISS | RequestStatus::HIT_RESERVED => {
                    warp.imiss_pending = true;
                    warp.pending_fragments.push_front(frag);
                }
                RequestStatus::RESERVATION_FAIL => {
                    warp.pending_fragments.push_front(frag);
                }
            }
            self.last_warp_fetched = warp_id;
            break;
        }
    }

    /// One core clock: sub-stages run back to front.
    pub fn cycle(&mut self, cycle: u64) -> eyre::Result<()> {
        self.writeback(cycle);
        self.execute(cycle);
        for _ in 0..self.issuer.config.reg_file_port_throughput {
            self.operand_collector.try_lock().step(cycle);
        }
        self.issue(cycle)?;
        self.decode(cycle);
        self.fetch(cycle);
        self.instr_l1.cycle(cycle);
        self.retire_finished_blocks();
        {
            let mut stats = self.issuer.stats.try_lock();
            stats.cycles += 1;
            let collector = self.operand_collector.try_lock();
            stats.regfile_bank_reads = collector.num_bank_reads;
            stats.regfile_bank_writes = collector.num_bank_writes;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FunctionalEngine, TableEngine};
    use crate::interconn::ToyInterconnect;
    use crate::opcodes::{Op, Opcode};

    type TestInterconn = ToyInterconnect<Packet<MemFetch>>;

    fn alu_instr(pc: address, out: Option<u32>, inputs: &[u32]) -> WarpInstruction {
        let mut instr = WarpInstruction::new(
            Opcode {
                op: Op::IADD,
                category: ArchOp::INT_OP,
            },
            pc,
        );
        if let Some(out) = out {
            instr.outputs[0] = Some(out);
        }
        for (slot, &reg) in inputs.iter().enumerate() {
            instr.inputs[slot] = Some(reg);
        }
        instr
    }

    fn exit_instr(pc: address) -> WarpInstruction {
        WarpInstruction::new(
            Opcode {
                op: Op::EXIT,
                category: ArchOp::EXIT_OPS,
            },
            pc,
        )
    }

    fn test_core(program: Vec<WarpInstruction>) -> Core<TestInterconn> {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = Arc::new(config::GPU::default());
        let interconn = Arc::new(TestInterconn::new(
            config.num_clusters,
            config.num_mem_partitions,
        ));
        let mut table = TableEngine::new();
        for instr in program {
            table.insert(instr);
        }
        let engine: Box<dyn FunctionalEngine> = Box::new(table);
        Core::new(0, 0, config, interconn, Arc::new(Mutex::new(engine)))
    }

    #[test]
    fn test_straight_line_program_retires() {
        let mut core = test_core(vec![
            alu_instr(0x0, Some(1), &[2, 3]),
            exit_instr(0x8),
        ]);
        core.issue_block(0, 0x0, 32).unwrap();
        assert_eq!(core.num_active_blocks(), 1);

        for cycle in 0..64 {
            core.cycle(cycle).unwrap();
        }

        let stats = core.issuer.stats.try_lock();
        assert_eq!(stats.instructions_issued, 2);
        assert_eq!(stats.instructions_completed, 2);
        assert_eq!(stats.warps_retired, 1);
        assert_eq!(stats.blocks_retired, 1);
        drop(stats);
        assert_eq!(core.num_active_blocks(), 0);
        assert!(core.issuer.warps[0].try_lock().done_exit());
    }

    #[test]
    fn test_two_warps_share_the_pipeline() {
        let mut core = test_core(vec![
            alu_instr(0x0, Some(1), &[2]),
            exit_instr(0x8),
        ]);
        // 64 threads: two warps, supervised by different schedulers
        core.issue_block(0, 0x0, 64).unwrap();

        for cycle in 0..128 {
            core.cycle(cycle).unwrap();
        }

        let stats = core.issuer.stats.try_lock();
        assert_eq!(stats.instructions_completed, 4);
        assert_eq!(stats.warps_retired, 2);
        assert_eq!(stats.blocks_retired, 1);
    }

    #[test]
    fn test_exit_with_buffered_sibling_retires_cleanly() {
        // decode buffers the exit and the unreachable instruction after
        // it in the same fragment; issuing the exit must discard the
        // sibling instead of renumbering it below the base level
        let mut core = test_core(vec![
            exit_instr(0x0),
            alu_instr(0x8, Some(1), &[2]),
        ]);
        core.issue_block(0, 0x0, 32).unwrap();

        for cycle in 0..64 {
            core.cycle(cycle).unwrap();
        }

        let stats = core.issuer.stats.try_lock();
        assert_eq!(stats.instructions_issued, 1);
        assert_eq!(stats.instructions_completed, 1);
        assert_eq!(stats.warps_retired, 1);
        assert_eq!(stats.blocks_retired, 1);
        drop(stats);
        let warp = core.issuer.warps[0].try_lock();
        assert!(warp.ibuffer_empty());
        assert_eq!(warp.num_instr_in_pipeline, 0);
    }

    #[test]
    fn test_control_hazard_flush_corrects_next_pc() {
        let mut core = test_core(vec![alu_instr(0x0, None, &[]), exit_instr(0x8)]);
        core.issue_block(0, 0x0, 32).unwrap();

        // plant a stale instruction whose pc disagrees with the stack
        {
            let mut warp = core.issuer.warps[0].try_lock();
            let mut stale = alu_instr(0x40, None, &[]);
            stale.warp_id = 0;
            warp.ibuffer_fill(0, 0, stale);
        }

        core.cycle(0).unwrap();

        assert_eq!(core.schedulers[0].stats.control_hazard_flushes, 1);
        let warp = core.issuer.warps[0].try_lock();
        assert_eq!(warp.next_pc, Some(0x0));
        assert!(warp.ibuffer_empty());
    }

    #[test]
    fn test_local_memaddr_translation_modes() {
        let core_with_map = |map| {
            let config = Arc::new(config::GPU {
                max_threads_per_core: 1024,
                num_clusters: 2,
                local_mem_map: map,
                ..config::GPU::default()
            });
            let interconn = Arc::new(TestInterconn::new(
                config.num_clusters,
                config.num_mem_partitions,
            ));
            let engine: Box<dyn FunctionalEngine> = Box::new(TableEngine::new());
            // cluster 1 so the core's slice sits past the first core's
            Core::new(0, 1, config, interconn, Arc::new(Mutex::new(engine)))
        };

        let base = instruction::LOCAL_GENERIC_START;
        let padded = core_with_map(config::LocalMemoryMap::Padded);
        assert_eq!(
            padded.translate_local_memaddr(0x20, 5),
            base + (instruction::MAX_THREAD_PER_SM + 5) * instruction::LOCAL_MEM_SIZE_MAX + 0x20
        );

        let contiguous = core_with_map(config::LocalMemoryMap::PerCoreContiguous);
        assert_eq!(
            contiguous.translate_local_memaddr(0x20, 5),
            base + (1024 + 5) * instruction::LOCAL_MEM_SIZE_MAX + 0x20
        );
    }

    #[test]
    fn test_pipe_width_caps_distinct_issue_groups() {
        let core = test_core(vec![]);
        // width 4, two fragments per warp: two distinct groups
        let stage = PipelineStage::ID_OC_SP;
        {
            let mut set = core.issuer.pipeline_reg[stage as usize].try_lock();
            let mut a = alu_instr(0x0, None, &[]);
            a.uid = 1;
            a.warp_id = 0;
            a.issue_cycle = Some(7);
            let mut b = alu_instr(0x0, None, &[]);
            b.uid = 2;
            b.warp_id = 1;
            b.issue_cycle = Some(7);
            set.move_in_from(Some(a));
            set.move_in_from(Some(b));
        }
        // resident groups may add fragments, new groups may not
        assert!(core.issuer.stage_can_accept(stage, (0, 7)));
        assert!(core.issuer.stage_can_accept(stage, (1, 7)));
        assert!(!core.issuer.stage_can_accept(stage, (2, 7)));
    }
}
