pub mod frag;
pub mod gto;
pub mod lrr;
pub mod swl;
pub mod two_level;

pub use frag::FragmentUtilization;
pub use gto::Gto;
pub use lrr::Lrr;
pub use swl::WarpLimiting;
pub use two_level::TwoLevelActive;

use crate::sync::{Arc, RwLock};
use crate::{
    config,
    core::{PipelineStage, WarpIssuer},
    instruction::WarpInstruction,
    opcodes::ArchOp,
    scoreboard, stats, warp,
};
use color_eyre::eyre;
use console::style;

/// Scheduling policy selected by configuration.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Deserialize,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Loose round robin.
    Lrr,
    /// Greedy then oldest.
    Gto,
    /// Bounded active subset with a pending queue.
    TwoLevelActive,
    /// Greedy then oldest over a capped candidate set.
    WarpLimiting,
    /// Issuable-lane count, descending.
    Frag,
}

impl Kind {
    #[must_use]
    pub fn build(self, config: &config::GPU) -> Box<dyn Policy> {
        match self {
            Kind::Lrr => Box::new(Lrr),
            Kind::Gto => Box::new(Gto),
            Kind::TwoLevelActive => Box::new(TwoLevelActive::new(config.two_level_max_active_warps)),
            Kind::WarpLimiting => Box::new(WarpLimiting::new(config.warp_limit)),
            Kind::Frag => Box::new(FragmentUtilization),
        }
    }
}

/// Read-only view a policy gets when ordering its supervised warps.
pub struct Request<'a> {
    pub supervised: &'a [warp::Ref],
    /// Index into `supervised` of the warp that issued last.
    pub last_issued_idx: usize,
    pub scoreboard: &'a dyn scoreboard::Access<WarpInstruction>,
    pub issuer: &'a dyn WarpIssuer,
    pub cycle: u64,
}

/// An ordering strategy over one scheduler's supervised warps.
///
/// Policies are pure orderings; the issue walk, hazard checks and stall
/// accounting live in [`Base`] and are shared by every policy.
pub trait Policy: Send + Sync + std::fmt::Debug + 'static {
    fn order_warps(&mut self, req: Request<'_>) -> Vec<warp::Ref>;

    fn notify_issued(&mut self, _warp_id: usize) {}
}

/// Oldest warps first; exited warps sort last.
pub(crate) fn sort_by_oldest_dynamic_id(warps: &mut [warp::Ref]) {
    warps.sort_by_key(|warp_ref| {
        let warp = warp_ref.try_lock();
        (warp.done_exit() || warp.ibuffer_empty(), warp.dynamic_warp_id)
    });
}

/// Destination stage for an instruction category.
///
/// Operations that may go either way prefer the general ALU pipeline;
/// [`Base`] falls back to the SFU pipeline when that stage is full.
#[must_use]
pub fn preferred_stage(category: ArchOp) -> PipelineStage {
    match category {
        ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP => PipelineStage::ID_OC_MEM,
        ArchOp::SFU_OP => PipelineStage::ID_OC_SFU,
        _ => PipelineStage::ID_OC_SP,
    }
}

/// One scheduler instance supervising a fixed subset of the core's warp
/// slots and issuing at most one winning warp per cycle.
pub struct Base {
    pub id: usize,
    pub cluster_id: usize,
    pub core_id: usize,
    pub supervised_warps: Vec<warp::Ref>,
    pub last_supervised_issued_idx: usize,
    scoreboard: Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>>,
    policy: Box<dyn Policy>,
    pub stats: stats::SchedulerStats,
    config: Arc<config::GPU>,
}

impl std::fmt::Debug for Base {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("core_id", &self.core_id)
            .field("num_supervised", &self.supervised_warps.len())
            .finish()
    }
}

impl Base {
    #[must_use]
    pub fn new(
        id: usize,
        cluster_id: usize,
        core_id: usize,
        supervised_warps: Vec<warp::Ref>,
        scoreboard: Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>>,
        policy: Box<dyn Policy>,
        config: Arc<config::GPU>,
    ) -> Self {
        Self {
            id,
            cluster_id,
            core_id,
            supervised_warps,
            last_supervised_issued_idx: 0,
            scoreboard,
            policy,
            stats: stats::SchedulerStats::default(),
            config,
        }
    }

    fn order_warps(&mut self, issuer: &dyn WarpIssuer, cycle: u64) -> Vec<warp::Ref> {
        let scoreboard = self.scoreboard.try_read();
        self.policy.order_warps(Request {
            supervised: &self.supervised_warps,
            last_issued_idx: self.last_supervised_issued_idx,
            scoreboard: &*scoreboard,
            issuer,
            cycle,
        })
    }

    /// Walk the prioritized warps and issue the first eligible
    /// instruction, then stop: one winning warp per scheduler per cycle.
    ///
    /// Additional fragments of the winning warp may issue in the same
    /// call; they share the winner's issue group key.
    pub fn cycle(&mut self, issuer: &mut dyn WarpIssuer, cycle: u64) -> eyre::Result<()> {
        let prioritized = self.order_warps(issuer, cycle);

        let mut valid_inst = false;
        let mut ready_inst = false;
        let mut issued_inst = false;

        'warps: for warp_ref in prioritized {
            let mut warp = warp_ref.try_lock();
            let warp_id = warp.warp_id;
            if warp.done_exit() {
                continue;
            }
            if self.config.imiss_issue_check && warp.imiss_pending {
                continue;
            }
            if issuer.warp_waiting_at_barrier(warp_id)
                || issuer.warp_waiting_at_mem_barrier(&mut warp)
                || warp.num_outstanding_atomics > 0
            {
                continue;
            }

            let slots: Vec<usize> = warp
                .occupied_slots()
                .take(self.config.max_warp_fragments)
                .collect();

            for slot in slots {
                let Some(entry) = warp.ibuffer_entry(slot) else {
                    continue;
                };
                valid_inst = true;
                let height = entry.height;
                let pc = entry.instr.pc;

                let Some(pdom) = issuer.pdom_entry(warp_id, height) else {
                    // the divergence level is gone; the fragment is stale
                    warp.ibuffer_flush_slot(slot);
                    self.stats.control_hazard_flushes += 1;
                    continue;
                };
                if pdom.pc != pc {
                    log::debug!(
                        "scheduler {}: warp {} control hazard at height {} (buffered pc={}, stack pc={})",
                        self.id,
                        warp_id,
                        height,
                        pc,
                        pdom.pc,
                    );
                    warp.next_pc = Some(pdom.pc);
                    warp.ibuffer_flush_slot(slot);
                    self.stats.control_hazard_flushes += 1;
                    continue;
                }

                let active_mask = issuer.active_mask(warp_id, height);
                let collides = {
                    let scoreboard = self.scoreboard.try_read();
                    scoreboard.check_collision(warp_id, &entry.instr, &active_mask)
                };
                if collides {
                    continue;
                }
                ready_inst = true;

                let category = entry.instr.opcode.category;
                let key = (warp_id, cycle);
                let mut stage = preferred_stage(category);
                if category == ArchOp::ALU_SFU_OP && !issuer.stage_can_accept(stage, key) {
                    stage = PipelineStage::ID_OC_SFU;
                }

                if issuer.stage_can_accept(stage, key) {
                    log::debug!(
                        "{}",
                        style(format!(
                            "cycle {:02} scheduler {}: issue warp {} slot {} -> {:?}",
                            cycle, self.id, warp_id, slot, stage
                        ))
                        .yellow()
                    );
                    issuer.issue_warp(stage, &mut warp, slot, self.id, cycle)?;
                    issued_inst = true;
                    self.stats.num_issued += 1;
                    self.policy.notify_issued(warp_id);
                    if let Some(idx) = self
                        .supervised_warps
                        .iter()
                        .position(|supervised| Arc::ptr_eq(supervised, &warp_ref))
                    {
                        self.last_supervised_issued_idx = idx;
                    }
                    // further fragments of this warp may join the group
                    continue;
                }
            }

            if issued_inst {
                break 'warps;
            }
        }

        if !valid_inst {
            self.stats.issue_idle_or_control_stall += 1;
        } else if !ready_inst {
            self.stats.issue_raw_hazard_stall += 1;
        } else if !issued_inst {
            self.stats.issue_pipeline_stall += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::MemorySpace;
    use crate::opcodes::Op;
    use crate::scoreboard::Scoreboard;
    use crate::simt::PdomEntry;
    use crate::sync::Mutex;
    use crate::warp::{ActiveMask, Warp};
    use crate::{address, UniqueWarpKey};
    use pretty_assertions_sorted as diff;

    /// Issues unconditionally (or not at all) and records the order.
    struct MockIssuer {
        accept: bool,
        pdom_pc: Option<address>,
        issued: Vec<usize>,
    }

    impl MockIssuer {
        fn new() -> Self {
            Self {
                accept: true,
                pdom_pc: Some(0x100),
                issued: Vec::new(),
            }
        }
    }

    impl WarpIssuer for MockIssuer {
        fn stage_can_accept(&self, _stage: PipelineStage, _key: UniqueWarpKey) -> bool {
            self.accept
        }

        fn issue_warp(
            &mut self,
            _stage: PipelineStage,
            warp: &mut Warp,
            slot: usize,
            _scheduler_id: usize,
            _cycle: u64,
        ) -> eyre::Result<()> {
            warp.ibuffer_take(slot);
            self.issued.push(warp.warp_id);
            Ok(())
        }

        fn warp_waiting_at_barrier(&self, _warp_id: usize) -> bool {
            false
        }

        fn warp_waiting_at_mem_barrier(&self, _warp: &mut Warp) -> bool {
            false
        }

        fn pdom_entry(&self, _warp_id: usize, _height: usize) -> Option<PdomEntry> {
            self.pdom_pc.map(|pc| PdomEntry {
                pc,
                reconvergence_pc: None,
            })
        }

        fn active_mask(&self, _warp_id: usize, _height: usize) -> ActiveMask {
            full_mask()
        }
    }

    fn full_mask() -> ActiveMask {
        let mut mask = ActiveMask::ZERO;
        mask.fill(true);
        mask
    }

    fn launched_warps(num: usize) -> Vec<warp::Ref> {
        (0..num)
            .map(|warp_id| {
                let mut warp = Warp::new(warp_id);
                warp.init(0, warp_id, 0x100, full_mask());
                Arc::new(Mutex::new(warp))
            })
            .collect()
    }

    fn nop_at(pc: address) -> WarpInstruction {
        WarpInstruction::new(
            crate::opcodes::Opcode {
                op: Op::NOP,
                category: ArchOp::ALU_OP,
            },
            pc,
        )
    }

    fn buffer(warp_ref: &warp::Ref, instr: WarpInstruction) {
        let mut warp = warp_ref.try_lock();
        let slot = warp.ibuffer_free_slot().unwrap();
        warp.ibuffer_fill(slot, 0, instr);
    }

    fn scheduler_with(
        warps: Vec<warp::Ref>,
        policy: Box<dyn Policy>,
    ) -> (Base, Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>>) {
        let scoreboard: Arc<RwLock<dyn scoreboard::Access<WarpInstruction>>> = Arc::new(
            RwLock::new(Scoreboard::new(0, 0, crate::config::MAX_WARPS_PER_CORE)),
        );
        let base = Base::new(
            0,
            0,
            0,
            warps,
            Arc::clone(&scoreboard),
            policy,
            Arc::new(config::GPU::default()),
        );
        (base, scoreboard)
    }

    #[test]
    fn test_lrr_issues_each_warp_once_per_rotation() {
        let warps = launched_warps(4);
        for warp_ref in &warps {
            buffer(warp_ref, nop_at(0x100));
        }
        let (mut scheduler, _) = scheduler_with(warps.clone(), Box::new(Lrr));
        let mut issuer = MockIssuer::new();

        for cycle in 0..4 {
            scheduler.cycle(&mut issuer, cycle).unwrap();
            // refill so every warp stays a candidate
            if let Some(&warp_id) = issuer.issued.last() {
                buffer(&warps[warp_id], nop_at(0x100));
            }
        }

        // the scan starts just after the last issued warp
        diff::assert_eq!(issuer.issued, vec![1, 2, 3, 0]);
        assert_eq!(scheduler.stats.num_issued, 4);
    }

    #[test]
    fn test_empty_buffers_count_as_idle_stall() {
        let warps = launched_warps(2);
        let (mut scheduler, _) = scheduler_with(warps, Box::new(Gto));
        let mut issuer = MockIssuer::new();

        scheduler.cycle(&mut issuer, 0).unwrap();

        assert_eq!(scheduler.stats.issue_idle_or_control_stall, 1);
        assert_eq!(scheduler.stats.num_issued, 0);
    }

    #[test]
    fn test_scoreboard_collision_counts_as_raw_hazard_stall() {
        let warps = launched_warps(1);
        let mut reader = nop_at(0x100);
        reader.inputs[0] = Some(5);
        buffer(&warps[0], reader);

        let (mut scheduler, scoreboard) = scheduler_with(warps, Box::new(Gto));
        scoreboard.try_write().reserve(0, 5, full_mask());
        let mut issuer = MockIssuer::new();

        scheduler.cycle(&mut issuer, 0).unwrap();

        assert_eq!(scheduler.stats.issue_raw_hazard_stall, 1);
        assert_eq!(scheduler.stats.num_issued, 0);
    }

    #[test]
    fn test_full_stage_counts_as_pipeline_stall() {
        let warps = launched_warps(1);
        buffer(&warps[0], nop_at(0x100));
        let (mut scheduler, _) = scheduler_with(warps, Box::new(Gto));
        let mut issuer = MockIssuer::new();
        issuer.accept = false;

        scheduler.cycle(&mut issuer, 0).unwrap();

        assert_eq!(scheduler.stats.issue_pipeline_stall, 1);
        assert_eq!(scheduler.stats.num_issued, 0);
    }

    #[test]
    fn test_stale_pc_is_flushed_and_next_pc_corrected() {
        let warps = launched_warps(1);
        buffer(&warps[0], nop_at(0x180));
        let (mut scheduler, _) = scheduler_with(warps.clone(), Box::new(Gto));
        let mut issuer = MockIssuer::new();
        issuer.pdom_pc = Some(0x100);

        scheduler.cycle(&mut issuer, 0).unwrap();

        assert_eq!(scheduler.stats.control_hazard_flushes, 1);
        assert_eq!(scheduler.stats.num_issued, 0);
        let warp = warps[0].try_lock();
        assert_eq!(warp.next_pc, Some(0x100));
        assert!(warp.ibuffer_empty());
    }

    #[test]
    fn test_two_level_demotes_warps_waiting_on_long_ops() {
        let warps = launched_warps(2);

        // warp 0 waits on the result of an outstanding global load
        let mut load = WarpInstruction::new(
            crate::opcodes::Opcode {
                op: Op::LDG,
                category: ArchOp::LOAD_OP,
            },
            0x0,
        );
        load.warp_id = 0;
        load.memory_space = Some(MemorySpace::Global);
        load.outputs[0] = Some(7);
        load.active_mask = full_mask();

        let mut reader = nop_at(0x100);
        reader.inputs[0] = Some(7);
        buffer(&warps[0], reader);
        buffer(&warps[1], nop_at(0x100));

        let (mut scheduler, scoreboard) =
            scheduler_with(warps, Box::new(TwoLevelActive::new(1)));
        scoreboard.try_write().reserve_all(&load);
        let mut issuer = MockIssuer::new();

        scheduler.cycle(&mut issuer, 0).unwrap();

        // warp 0 left the active subset; warp 1 took its place and issued
        assert_eq!(issuer.issued, vec![1]);
    }
}
