use super::{PipelinedSimdUnit, SimdFunctionUnit};
use crate::sync::{Arc, Mutex, RwLock};
use crate::{
    cache::{Cache, PerfectCache},
    config,
    core::PipelineStage,
    instruction::{CacheOperator, MemorySpace, WarpInstruction},
    interconn::{Interconnect, Packet},
    mem_fetch::{self, MemFetch},
    operand_collector::{self, Writeback},
    scoreboard, stats,
    warp::{self, ActiveMask},
};
use std::collections::{HashMap, VecDeque};

/// Memory pipeline sub-stage an access belongs to, for stall accounting.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::AsRefStr)]
pub enum MemStageAccessKind {
    C_MEM,
    T_MEM,
    S_MEM,
    G_MEM_LD,
    L_MEM_LD,
    G_MEM_ST,
    L_MEM_ST,
}

/// Why the memory stage could not advance an access this cycle.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::AsRefStr)]
pub enum MemStageStallKind {
    NO_RC_FAIL,
    BK_CONF,
    MSHR_RC_FAIL,
    ICNT_RC_FAIL,
    COAL_STALL,
    DATA_PORT_STALL,
    WB_ICNT_RC_FAIL,
    WB_CACHE_RSRV_FAIL,
}

/// Sources competing for the load store unit's single writeback register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::EnumCount)]
#[repr(usize)]
pub enum WritebackClient {
    SharedMemory = 0,
    L1T,
    L1C,
    GlobalLocal,
    L1D,
}

pub const NUM_WRITEBACK_CLIENTS: usize = 5;

/// Per warp, per destination register, per active-lane mask count of
/// outstanding load responses.
///
/// Mask-keyed because divergent fragments keep separate loads to the
/// same architectural register in flight; the scoreboard reservation for
/// a `(reg, mask)` pair is released exactly when its counter hits zero.
type PendingWrites = HashMap<usize, HashMap<u32, HashMap<ActiveMask, usize>>>;

/// Memory pipeline: shared, constant, texture, global and local access
/// timing plus the writeback of returning loads.
pub struct LoadStoreUnit<I> {
    pub core_id: usize,
    pub cluster_id: usize,
    /// Fixed-latency path for shared memory loads; surfaces at the
    /// pipeline head for the [`WritebackClient::SharedMemory`] client.
    inner: PipelinedSimdUnit,
    pub dispatch_reg: Option<WarpInstruction>,
    pub response_fifo: VecDeque<MemFetch>,
    pub data_l1: Box<dyn Cache>,
    pub const_l1: Box<dyn Cache>,
    pub texture_l1: Box<dyn Cache>,
    interconn: Arc<I>,
    pending_writes: PendingWrites,
    next_writeback: Option<WarpInstruction>,
    writeback_arb: usize,
    /// Bypass-path load response waiting for the writeback register.
    next_global: Option<MemFetch>,
    warps: Vec<warp::Ref>,
    scoreboard: Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>>,
    pub operand_collector: operand_collector::Ref,
    stats: Arc<Mutex<stats::CoreStats>>,
    config: Arc<config::GPU>,
    fetch_uid: u64,
}

impl<I> LoadStoreUnit<I>
where
    I: Interconnect<Packet<MemFetch>>,
{
    #[must_use]
    pub fn new(
        id: usize,
        core_id: usize,
        cluster_id: usize,
        warps: Vec<warp::Ref>,
        interconn: Arc<I>,
        operand_collector: operand_collector::Ref,
        scoreboard: Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>>,
        config: Arc<config::GPU>,
        stats: Arc<Mutex<stats::CoreStats>>,
    ) -> Self {
        let inner = PipelinedSimdUnit::new(
            id,
            format!("LdstUnit[{id}]"),
            None,
            config.shared_memory_latency,
            Arc::clone(&config),
        );
        Self {
            core_id,
            cluster_id,
            inner,
            dispatch_reg: None,
            response_fifo: VecDeque::new(),
            data_l1: Box::<PerfectCache>::default(),
            const_l1: Box::<PerfectCache>::default(),
            texture_l1: Box::<PerfectCache>::default(),
            interconn,
            pending_writes: PendingWrites::new(),
            next_writeback: None,
            writeback_arb: 0,
            next_global: None,
            warps,
            scoreboard,
            operand_collector,
            stats,
            config,
            fetch_uid: 0,
        }
    }

    #[must_use]
    pub fn response_buffer_full(&self) -> bool {
        self.response_fifo.len() >= self.config.ldst_response_buffer_size
    }

    /// Accept a memory response routed down from the cluster.
    pub fn fill(&mut self, mut fetch: MemFetch) {
        fetch.status = mem_fetch::Status::IN_SHADER_LDST_RESPONSE_FIFO;
        self.response_fifo.push_back(fetch);
    }

    #[must_use]
    pub fn pending_write_count(&self, warp_id: usize, reg: u32, mask: ActiveMask) -> usize {
        self.pending_writes
            .get(&warp_id)
            .and_then(|regs| regs.get(&reg))
            .and_then(|masks| masks.get(&mask))
            .copied()
            .unwrap_or(0)
    }

    /// One load response serviced: decrement the mask-keyed counter and
    /// release the scoreboard reservation when it reaches zero.
    fn decrement_pending(&mut self, warp_id: usize, reg: u32, mask: ActiveMask) {
        let Some(regs) = self.pending_writes.get_mut(&warp_id) else {
            return;
        };
        let Some(masks) = regs.get_mut(&reg) else {
            return;
        };
        let Some(count) = masks.get_mut(&mask) else {
            return;
        };
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            masks.remove(&mask);
            self.scoreboard.try_write().release(warp_id, reg, mask);
        }
        if masks.is_empty() {
            regs.remove(&reg);
        }
    }

    fn instruction_complete(&mut self, instr: &WarpInstruction) {
        let mut stats = self.stats.try_lock();
        stats.instructions_completed += 1;
        stats.thread_instructions_executed += instr.active_count() as u64;
        let mut warp = self.warps[instr.warp_id].try_lock();
        debug_assert!(warp.num_instr_in_pipeline > 0);
        warp.num_instr_in_pipeline -= 1;
    }

    fn store_ack(&mut self, fetch: &MemFetch) {
        let mut warp = self.warps[fetch.warp_id].try_lock();
        debug_assert!(warp.num_outstanding_stores > 0);
        warp.num_outstanding_stores -= 1;
    }

    fn next_fetch_uid(&mut self) -> u64 {
        let uid = self.fetch_uid;
        self.fetch_uid += 1;
        uid
    }

    fn memory_partition(&self, addr: crate::address) -> usize {
        ((addr >> 8) as usize) % self.config.num_mem_partitions.max(1)
    }

    /// Drain the writeback register, then pick the next client in
    /// rotating priority order.
    fn writeback(&mut self, _cycle: u64) {
        if self.next_writeback.is_some() {
            // the register file clears destination slots as banks are
            // won, so snapshot them first
            let dest_regs: Vec<u32> = self
                .next_writeback
                .as_ref()
                .map(|instr| instr.dest_regs().collect())
                .unwrap_or_default();
            let written = {
                let mut collector = self.operand_collector.try_lock();
                match self.next_writeback.as_mut() {
                    Some(next) => collector.writeback(next),
                    None => false,
                }
            };
            if written {
                if let Some(instr) = self.next_writeback.take() {
                    let warp_id = instr.warp_id;
                    for &reg in &dest_regs {
                        if self.pending_write_count(warp_id, reg, instr.active_mask) > 0 {
                            self.decrement_pending(warp_id, reg, instr.active_mask);
                        } else {
                            // shared path loads carry no pending counters
                            self.scoreboard
                                .try_write()
                                .release(warp_id, reg, instr.active_mask);
                        }
                    }
                    // completion is per fragment: a sibling's in-flight
                    // load to the same register must not hold this one
                    let all_done = dest_regs.iter().all(|&reg| {
                        self.pending_write_count(warp_id, reg, instr.active_mask) == 0
                    });
                    if all_done {
                        self.instruction_complete(&instr);
                    }
                }
            }
        }

        if self.next_writeback.is_some() {
            return;
        }
        let mut serviced = None;
        for i in 0..NUM_WRITEBACK_CLIENTS {
            let client_id = (self.writeback_arb + i) % NUM_WRITEBACK_CLIENTS;
            let Some(client) = WritebackClient::from_repr(client_id) else {
                continue;
            };
            match client {
                WritebackClient::SharedMemory => {
                    if self.inner.pipeline_reg[0].is_some() {
                        self.next_writeback = self.inner.pipeline_reg[0].take();
                    }
                }
                WritebackClient::L1T => {
                    if self.texture_l1.access_ready() {
                        if let Some(fetch) = self.texture_l1.next_access() {
                            self.next_writeback = fetch.instr;
                        }
                    }
                }
                WritebackClient::L1C => {
                    if self.const_l1.access_ready() {
                        if let Some(fetch) = self.const_l1.next_access() {
                            self.next_writeback = fetch.instr;
                        }
                    }
                }
                WritebackClient::GlobalLocal => {
                    if let Some(fetch) = self.next_global.take() {
                        self.next_writeback = fetch.instr;
                    }
                }
                WritebackClient::L1D => {
                    if self.data_l1.access_ready() {
                        if let Some(fetch) = self.data_l1.next_access() {
                            self.next_writeback = fetch.instr;
                        }
                    }
                }
            }
            if self.next_writeback.is_some() {
                serviced = Some(client_id);
                break;
            }
        }
        // the arbiter moves past the serviced client
        if let Some(client_id) = serviced {
            self.writeback_arb = (client_id + 1) % NUM_WRITEBACK_CLIENTS;
        }
    }

    fn process_response_fifo(&mut self, cycle: u64) {
        let Some(front) = self.response_fifo.front() else {
            return;
        };
        if front.is_texture() {
            if self.texture_l1.fill_port_free() {
                if let Some(fetch) = self.response_fifo.pop_front() {
                    self.texture_l1.fill(fetch, cycle);
                }
            }
        } else if front.is_const() {
            if self.const_l1.fill_port_free() {
                if let Some(fetch) = self.response_fifo.pop_front() {
                    self.const_l1.fill(fetch, cycle);
                }
            }
        } else if front.kind == mem_fetch::Kind::WRITE_ACK {
            if let Some(fetch) = self.response_fifo.pop_front() {
                self.store_ack(&fetch);
            }
        } else {
            let bypassed_l1 = self.config.gmem_skip_l1d
                || front
                    .instr
                    .as_ref()
                    .is_some_and(|instr| instr.cache_operator == CacheOperator::GLOBAL);
            if bypassed_l1 {
                if self.next_global.is_none() {
                    self.next_global = self.response_fifo.pop_front();
                }
            } else if self.data_l1.fill_port_free() {
                if let Some(fetch) = self.response_fifo.pop_front() {
                    self.data_l1.fill(fetch, cycle);
                }
            }
        }
    }

    /// Shared memory traffic stays on chip inside the fixed latency
    /// pipeline; bank conflict timing is not modeled, so the stage never
    /// stalls here.
    fn shared_cycle(&mut self) -> bool {
        if let Some(instr) = self.dispatch_reg.as_mut() {
            if instr.memory_space == Some(MemorySpace::Shared) {
                instr.mem_access_queue.clear();
            }
        }
        true
    }

    fn cache_cycle(
        &mut self,
        space: MemorySpace,
        access_kind: MemStageAccessKind,
        cycle: u64,
        stall: &mut MemStageStallKind,
        kind: &mut Option<MemStageAccessKind>,
    ) -> bool {
        let Some(instr) = self.dispatch_reg.as_ref() else {
            return true;
        };
        if instr.memory_space != Some(space) || instr.mem_access_queue.is_empty() {
            return true;
        }
        let port_free = match space {
            MemorySpace::Constant => self.const_l1.data_port_free(),
            MemorySpace::Texture => self.texture_l1.data_port_free(),
            _ => self.data_l1.data_port_free(),
        };
        if !port_free {
            *stall = MemStageStallKind::DATA_PORT_STALL;
            *kind = Some(access_kind);
            return false;
        }

        let warp_id = instr.warp_id;
        let active_mask = instr.active_mask;
        let is_load = instr.is_load();
        let dest_regs: Vec<u32> = instr.dest_regs().collect();
        let uid = self.next_fetch_uid();
        let fetch = {
            let Some(instr) = self.dispatch_reg.as_ref() else {
                return true;
            };
            let Some(access) = instr.mem_access_queue.front() else {
                return true;
            };
            MemFetch::new(
                uid,
                access.clone(),
                Some(instr.clone()),
                warp_id,
                self.core_id,
                self.cluster_id,
            )
        };
        let addr = fetch.addr();
        let mut events = Vec::new();
        let status = match space {
            MemorySpace::Constant => self.const_l1.access(addr, fetch, &mut events, cycle),
            MemorySpace::Texture => self.texture_l1.access(addr, fetch, &mut events, cycle),
            _ => self.data_l1.access(addr, fetch, &mut events, cycle),
        };
        match status {
            crate::cache::RequestStatus::HIT => {
                if let Some(instr) = self.dispatch_reg.as_mut() {
                    instr.mem_access_queue.pop_front();
                }
                if is_load {
                    for reg in dest_regs {
                        self.decrement_pending(warp_id, reg, active_mask);
                    }
                }
                true
            }
            crate::cache::RequestStatus::HIT_RESERVED | crate::cache::RequestStatus::MISS => {
                if let Some(instr) = self.dispatch_reg.as_mut() {
                    instr.mem_access_queue.pop_front();
                }
                true
            }
            crate::cache::RequestStatus::RESERVATION_FAIL => {
                *stall = MemStageStallKind::MSHR_RC_FAIL;
                *kind = Some(access_kind);
                false
            }
        }
    }

    fn constant_cycle(
        &mut self,
        cycle: u64,
        stall: &mut MemStageStallKind,
        kind: &mut Option<MemStageAccessKind>,
    ) -> bool {
        self.cache_cycle(
            MemorySpace::Constant,
            MemStageAccessKind::C_MEM,
            cycle,
            stall,
            kind,
        )
    }

    fn texture_cycle(
        &mut self,
        cycle: u64,
        stall: &mut MemStageStallKind,
        kind: &mut Option<MemStageAccessKind>,
    ) -> bool {
        self.cache_cycle(
            MemorySpace::Texture,
            MemStageAccessKind::T_MEM,
            cycle,
            stall,
            kind,
        )
    }

    fn memory_cycle(
        &mut self,
        cycle: u64,
        stall: &mut MemStageStallKind,
        kind: &mut Option<MemStageAccessKind>,
    ) -> bool {
        let Some(instr) = self.dispatch_reg.as_ref() else {
            return true;
        };
        let space = instr.memory_space;
        if !matches!(
            space,
            Some(MemorySpace::Global) | Some(MemorySpace::Local) | None
        ) {
            return true;
        }
        let Some(access) = instr.mem_access_queue.front() else {
            return true;
        };

        let access_kind = match (space, instr.is_store()) {
            (Some(MemorySpace::Local), false) => MemStageAccessKind::L_MEM_LD,
            (Some(MemorySpace::Local), true) => MemStageAccessKind::L_MEM_ST,
            (_, false) => MemStageAccessKind::G_MEM_LD,
            (_, true) => MemStageAccessKind::G_MEM_ST,
        };
        let bypass_l1 = self.config.gmem_skip_l1d
            || (access.kind.is_global() && instr.cache_operator == CacheOperator::GLOBAL);

        if bypass_l1 {
            let size = access.size();
            let dest = self.config.mem_device(self.memory_partition(access.addr));
            if !self.interconn.has_buffer(dest, size) {
                *stall = MemStageStallKind::ICNT_RC_FAIL;
                *kind = Some(access_kind);
                return false;
            }
            let warp_id = instr.warp_id;
            let is_store = instr.is_store();
            let uid = self.next_fetch_uid();
            let fetch = {
                let Some(instr) = self.dispatch_reg.as_mut() else {
                    return true;
                };
                let instr_copy = instr.clone();
                let Some(access) = instr.mem_access_queue.pop_front() else {
                    return true;
                };
                MemFetch::new(
                    uid,
                    access,
                    Some(instr_copy),
                    warp_id,
                    self.core_id,
                    self.cluster_id,
                )
            };
            self.interconn.push(
                self.cluster_id,
                dest,
                Packet {
                    data: fetch,
                    time: cycle,
                },
                size,
            );
            if is_store {
                self.warps[warp_id].try_lock().num_outstanding_stores += 1;
            }
            true
        } else {
            self.cache_cycle(
                space.unwrap_or(MemorySpace::Global),
                access_kind,
                cycle,
                stall,
                kind,
            )
        }
    }

    /// Move the dispatch register's instruction out once its accesses
    /// have all been handed to the memory system.
    ///
    /// Loads whose responses are all in (every access hit) complete here;
    /// loads with outstanding responses complete later in the writeback
    /// drain. Stores and barriers complete as soon as their traffic is on
    /// its way.
    fn retire_dispatch_reg(&mut self) {
        let retire = self
            .dispatch_reg
            .as_ref()
            .is_some_and(|instr| instr.mem_access_queue.is_empty());
        if !retire {
            return;
        }
        let Some(instr) = self.dispatch_reg.take() else {
            return;
        };
        if instr.is_load() {
            let pending = instr
                .dest_regs()
                .any(|reg| self.pending_write_count(instr.warp_id, reg, instr.active_mask) > 0);
            if !pending {
                // scoreboard lanes were already released as the counters
                // reached zero
                self.instruction_complete(&instr);
            }
        } else {
            self.scoreboard.try_write().release_all(&instr);
            self.instruction_complete(&instr);
        }
    }
}

impl<I> SimdFunctionUnit for LoadStoreUnit<I>
where
    I: Interconnect<Packet<MemFetch>> + 'static,
{
    fn id(&self) -> &str {
        &self.inner.name
    }

    fn issue_port(&self) -> PipelineStage {
        PipelineStage::OC_EX_MEM
    }

    fn stallable(&self) -> bool {
        true
    }

    fn can_issue(&self, instr: &WarpInstruction) -> bool {
        use crate::opcodes::ArchOp;
        match instr.opcode.category {
            ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP => {
                if instr.is_load() && instr.memory_space == Some(MemorySpace::Shared) {
                    self.inner.can_issue(instr)
                } else {
                    self.dispatch_reg.is_none()
                }
            }
            _ => false,
        }
    }

    fn issue(&mut self, instr: WarpInstruction) {
        debug_assert!(self.can_issue(&instr));
        if instr.is_load() && instr.memory_space != Some(MemorySpace::Shared) {
            let num_accesses = instr.accessq_count();
            if num_accesses > 0 {
                for reg in instr.dest_regs() {
                    *self
                        .pending_writes
                        .entry(instr.warp_id)
                        .or_default()
                        .entry(reg)
                        .or_default()
                        .entry(instr.active_mask)
                        .or_insert(0) += num_accesses;
                }
            }
        }
        if instr.is_load() && instr.memory_space == Some(MemorySpace::Shared) {
            self.inner.issue(instr);
        } else {
            debug_assert!(self.dispatch_reg.is_none());
            self.dispatch_reg = Some(instr);
        }
    }

    fn cycle(&mut self, cycle: u64) {
        self.writeback(cycle);
        self.inner.cycle(cycle);
        self.process_response_fifo(cycle);
        self.texture_l1.cycle(cycle);
        self.const_l1.cycle(cycle);
        self.data_l1.cycle(cycle);

        let mut stall = MemStageStallKind::NO_RC_FAIL;
        let mut kind = None;
        let mut done = true;
        done &= self.shared_cycle();
        done &= self.constant_cycle(cycle, &mut stall, &mut kind);
        done &= self.texture_cycle(cycle, &mut stall, &mut kind);
        done &= self.memory_cycle(cycle, &mut stall, &mut kind);

        if done {
            self.retire_dispatch_reg();
        } else if let Some(kind) = kind {
            self.stats.try_lock().record_mem_stage_stall(kind, stall);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interconn::ToyInterconnect;
    use crate::mem_fetch::access::{Kind as AccessKind, MemAccess};
    use crate::opcodes::{ArchOp, Op, Opcode};
    use crate::operand_collector::RegisterFileUnit;
    use crate::scoreboard::Scoreboard;
    use crate::warp::Warp;

    type TestInterconn = ToyInterconnect<Packet<MemFetch>>;

    fn mask(bits: u32) -> ActiveMask {
        ActiveMask::from([bits])
    }

    fn setup(
        config: config::GPU,
    ) -> (
        LoadStoreUnit<TestInterconn>,
        Arc<TestInterconn>,
        Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>>,
        Vec<warp::Ref>,
        Arc<Mutex<stats::CoreStats>>,
    ) {
        let config = Arc::new(config);
        let interconn = Arc::new(TestInterconn::new(
            config.num_clusters,
            config.num_mem_partitions,
        ));
        let warps: Vec<warp::Ref> = (0..config.max_warps_per_core)
            .map(|id| Arc::new(Mutex::new(Warp::new(id))))
            .collect();
        let scoreboard: Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>> =
            Arc::new(RwLock::new(Scoreboard::new(0, 0, config.max_warps_per_core)));
        let collector = Arc::new(Mutex::new(RegisterFileUnit::new(Arc::clone(&config))));
        let stats = Arc::new(Mutex::new(stats::CoreStats::default()));
        let unit = LoadStoreUnit::new(
            0,
            0,
            0,
            warps.clone(),
            Arc::clone(&interconn),
            collector,
            Arc::clone(&scoreboard),
            config,
            Arc::clone(&stats),
        );
        (unit, interconn, scoreboard, warps, stats)
    }

    fn global_load(
        warp_id: usize,
        dest: u32,
        active: ActiveMask,
        num_accesses: usize,
    ) -> WarpInstruction {
        let mut instr = WarpInstruction::new(
            Opcode {
                op: Op::LDG,
                category: ArchOp::LOAD_OP,
            },
            0x100,
        );
        instr.warp_id = warp_id;
        instr.issue_cycle = Some(1);
        instr.memory_space = Some(MemorySpace::Global);
        instr.active_mask = active;
        instr.outputs[0] = Some(dest);
        for i in 0..num_accesses {
            instr.mem_access_queue.push_back(MemAccess::new(
                AccessKind::GLOBAL_ACC_R,
                0x1000 + i as u64 * 128,
                32,
            ));
        }
        instr
    }

    fn global_store(warp_id: usize, active: ActiveMask) -> WarpInstruction {
        let mut instr = WarpInstruction::new(
            Opcode {
                op: Op::STG,
                category: ArchOp::STORE_OP,
            },
            0x108,
        );
        instr.warp_id = warp_id;
        instr.issue_cycle = Some(1);
        instr.memory_space = Some(MemorySpace::Global);
        instr.active_mask = active;
        instr
            .mem_access_queue
            .push_back(MemAccess::new(AccessKind::GLOBAL_ACC_W, 0x2000, 32));
        instr
    }

    #[test]
    fn test_pending_writes_released_as_hits_drain() {
        let (mut unit, _icnt, scoreboard, warps, stats) = setup(config::GPU::default());
        let active = mask(0xffff_ffff);
        let load = global_load(3, 8, active, 2);
        scoreboard.try_write().reserve(3, 8, active);
        warps[3].try_lock().num_instr_in_pipeline = 1;

        unit.issue(load);
        assert_eq!(unit.pending_write_count(3, 8, active), 2);

        // one access serviced per cycle against the (perfect) data cache
        unit.cycle(0);
        assert_eq!(unit.pending_write_count(3, 8, active), 1);
        assert!(scoreboard.try_read().pending_writes(3));

        unit.cycle(1);
        assert_eq!(unit.pending_write_count(3, 8, active), 0);
        assert!(!scoreboard.try_read().pending_writes(3));
        // all responses were in, so the load completed at the dispatch reg
        assert!(unit.dispatch_reg.is_none());
        assert_eq!(stats.try_lock().instructions_completed, 1);
        assert_eq!(warps[3].try_lock().num_instr_in_pipeline, 0);
    }

    #[test]
    fn test_mask_keyed_counters_stay_separate() {
        let (mut unit, _icnt, scoreboard, warps, _stats) = setup(config::GPU::default());
        let low = mask(0x0000_ffff);
        let high = mask(0xffff_0000);
        scoreboard.try_write().reserve(0, 5, low);
        scoreboard.try_write().reserve(0, 5, high);
        warps[0].try_lock().num_instr_in_pipeline = 1;

        let mut low_load = global_load(0, 5, low, 1);
        low_load.active_mask = low;
        unit.issue(low_load);
        unit.cycle(0);
        unit.cycle(1);

        // the low fragment's counter reached zero; only its lanes were
        // released
        assert_eq!(unit.pending_write_count(0, 5, low), 0);
        let sb = scoreboard.try_read();
        let mut reader = global_load(0, 99, high, 0);
        reader.outputs[0] = None;
        reader.inputs[0] = Some(5);
        assert!(sb.check_collision(0, &reader, &high));
        assert!(!sb.check_collision(0, &reader, &low));
    }

    #[test]
    fn test_store_pushes_to_interconnect_and_ack_returns() {
        let (mut unit, icnt, _scoreboard, warps, stats) = setup(config::GPU {
            gmem_skip_l1d: true,
            ..config::GPU::default()
        });
        let active = mask(0xf);
        warps[2].try_lock().num_instr_in_pipeline = 1;

        unit.issue(global_store(2, active));
        unit.cycle(0);

        // the store left the pipeline but stays outstanding until acked
        assert!(unit.dispatch_reg.is_none());
        assert_eq!(stats.try_lock().instructions_completed, 1);
        assert_eq!(warps[2].try_lock().num_outstanding_stores, 1);

        let packet = icnt.pop(1).expect("store request on the interconnect");
        let mut reply = packet.data;
        reply.set_reply();
        assert_eq!(reply.kind, mem_fetch::Kind::WRITE_ACK);

        unit.fill(reply);
        unit.cycle(1);
        assert_eq!(warps[2].try_lock().num_outstanding_stores, 0);
    }

    #[test]
    fn test_bypassed_load_completes_through_writeback_drain() {
        let (mut unit, icnt, scoreboard, warps, stats) = setup(config::GPU {
            gmem_skip_l1d: true,
            ..config::GPU::default()
        });
        let active = mask(0xffff_ffff);
        scoreboard.try_write().reserve(1, 10, active);
        warps[1].try_lock().num_instr_in_pipeline = 1;

        unit.issue(global_load(1, 10, active, 1));
        assert_eq!(unit.pending_write_count(1, 10, active), 1);
        unit.cycle(0);
        // the request went out; the load left dispatch without completing
        assert!(unit.dispatch_reg.is_none());
        assert_eq!(stats.try_lock().instructions_completed, 0);

        let packet = icnt.pop(1).expect("load request on the interconnect");
        let mut reply = packet.data;
        reply.set_reply();
        unit.fill(reply);

        // cycle 1 stages the response, cycle 2 claims the writeback
        // register, cycle 3 drains it
        unit.cycle(1);
        unit.cycle(2);
        unit.cycle(3);
        assert_eq!(unit.pending_write_count(1, 10, active), 0);
        assert!(!scoreboard.try_read().pending_writes(1));
        assert_eq!(stats.try_lock().instructions_completed, 1);
    }

    #[test]
    fn test_divergent_loads_to_same_register_both_complete() {
        let (mut unit, icnt, scoreboard, warps, stats) = setup(config::GPU {
            gmem_skip_l1d: true,
            ..config::GPU::default()
        });
        let low = mask(0x0000_ffff);
        let high = mask(0xffff_0000);
        scoreboard.try_write().reserve(0, 10, low);
        scoreboard.try_write().reserve(0, 10, high);
        warps[0].try_lock().num_instr_in_pipeline = 2;

        unit.issue(global_load(0, 10, low, 1));
        unit.cycle(0);
        unit.issue(global_load(0, 10, high, 1));
        unit.cycle(1);

        for _ in 0..2 {
            let packet = icnt.pop(1).expect("load request on the interconnect");
            let mut reply = packet.data;
            reply.set_reply();
            unit.fill(reply);
        }

        for cycle in 2..8 {
            unit.cycle(cycle);
            // the core steps the register file every cycle, freeing the
            // bank claims taken by writeback
            unit.operand_collector.try_lock().step(cycle);
        }

        // each fragment's drain completes its own load; the sibling's
        // counter for the shared register must not hold it hostage
        assert_eq!(unit.pending_write_count(0, 10, low), 0);
        assert_eq!(unit.pending_write_count(0, 10, high), 0);
        assert!(!scoreboard.try_read().pending_writes(0));
        assert_eq!(stats.try_lock().instructions_completed, 2);
        assert_eq!(warps[0].try_lock().num_instr_in_pipeline, 0);
    }
}
