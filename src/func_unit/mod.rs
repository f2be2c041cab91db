pub mod load_store;
pub mod sfu;
pub mod sp;

pub use load_store::LoadStoreUnit;
pub use sfu::SfuUnit;
pub use sp::SPUnit;

use crate::sync::Arc;
use crate::{config, core::PipelineStage, instruction::WarpInstruction, register_set};
use bitvec::BitArr;

/// Upper bound on any unit's result latency; sizes result bus and
/// pipeline occupancy masks.
pub const MAX_ALU_LATENCY: usize = 512;

/// One bit per future cycle a result (or pipeline slot) is claimed for.
pub type OccupiedSlots = BitArr!(for MAX_ALU_LATENCY);

/// Timing interface of one execution unit.
///
/// The core moves ready instructions from the unit's issue port into the
/// unit; non-stallable units additionally need a free result bus slot at
/// the instruction's latency before they may accept it.
pub trait SimdFunctionUnit: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Pipeline register stage this unit drains.
    fn issue_port(&self) -> PipelineStage;

    /// Whether the unit can hold a result back instead of dropping it.
    fn stallable(&self) -> bool;

    fn can_issue(&self, instr: &WarpInstruction) -> bool;

    fn issue(&mut self, instr: WarpInstruction);

    fn cycle(&mut self, cycle: u64);
}

/// Fixed-depth execution pipeline shared by the ALU style units.
///
/// An issued instruction sits in the dispatch register for its dispatch
/// delay, then enters the pipeline `latency - initiation_interval` slots
/// from the head and drifts one slot per cycle until it spills into the
/// result port.
#[derive(Debug)]
pub struct PipelinedSimdUnit {
    pub name: String,
    pub id: usize,
    pub result_port: Option<register_set::Ref>,
    pub pipeline_reg: Vec<Option<WarpInstruction>>,
    pub dispatch_reg: Option<WarpInstruction>,
    pub occupied: OccupiedSlots,
    pub config: Arc<config::GPU>,
}

impl PipelinedSimdUnit {
    #[must_use]
    pub fn new(
        id: usize,
        name: String,
        result_port: Option<register_set::Ref>,
        depth: usize,
        config: Arc<config::GPU>,
    ) -> Self {
        assert!(depth > 0);
        let pipeline_reg = (0..depth).map(|_| None).collect();
        Self {
            name,
            id,
            result_port,
            pipeline_reg,
            dispatch_reg: None,
            occupied: OccupiedSlots::ZERO,
            config,
        }
    }

    #[must_use]
    pub fn num_active_instr_in_pipeline(&self) -> usize {
        self.pipeline_reg.iter().flatten().count()
    }

    #[must_use]
    pub fn can_issue(&self, instr: &WarpInstruction) -> bool {
        let latency = instr.latency.min(MAX_ALU_LATENCY - 1);
        self.dispatch_reg.is_none() && !self.occupied[latency]
    }

    pub fn issue(&mut self, instr: WarpInstruction) {
        debug_assert!(self.dispatch_reg.is_none());
        let latency = instr.latency.min(MAX_ALU_LATENCY - 1);
        self.occupied.set(latency, true);
        log::debug!("{}: issue {}", self.name, instr);
        self.dispatch_reg = Some(instr);
    }

    pub fn cycle(&mut self, _cycle: u64) {
        if let Some(port) = &self.result_port {
            if self.pipeline_reg[0].is_some() {
                let mut port = port.try_lock();
                if port.has_free() {
                    let head = self.pipeline_reg[0].take();
                    port.move_in_from(head);
                }
            }
        }
        for stage in 0..self.pipeline_reg.len() - 1 {
            if self.pipeline_reg[stage].is_none() {
                self.pipeline_reg[stage] = self.pipeline_reg[stage + 1].take();
            }
        }
        if let Some(dispatched) = &mut self.dispatch_reg {
            if dispatched.dispatch_delay_cycles > 0 {
                dispatched.dispatch_delay_cycles -= 1;
            } else {
                let start = dispatched
                    .latency
                    .saturating_sub(dispatched.initiation_interval)
                    .min(self.pipeline_reg.len() - 1);
                if self.pipeline_reg[start].is_none() {
                    self.pipeline_reg[start] = self.dispatch_reg.take();
                }
            }
        }
        self.occupied.shift_left(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ArchOp, Op, Opcode};
    use crate::register_set::RegisterSet;
    use crate::sync::Mutex;

    fn instr_with_latency(latency: usize) -> WarpInstruction {
        let mut instr = WarpInstruction::new(
            Opcode {
                op: Op::IADD,
                category: ArchOp::INT_OP,
            },
            0x100,
        );
        instr.latency = latency;
        instr.initiation_interval = 1;
        instr
    }

    #[test]
    fn test_result_appears_after_latency_cycles() {
        let config = Arc::new(config::GPU::default());
        let port = Arc::new(Mutex::new(RegisterSet::new(PipelineStage::EX_WB, 2, 0)));
        let mut unit = PipelinedSimdUnit::new(0, "sp".into(), Some(Arc::clone(&port)), 13, config);

        let instr = instr_with_latency(4);
        assert!(unit.can_issue(&instr));
        unit.issue(instr);

        // enters the pipeline at slot 3, drifts to the head, then drains
        for cycle in 0..4 {
            unit.cycle(cycle);
            assert_eq!(port.try_lock().iter_occupied().count(), 0);
        }
        unit.cycle(4);
        assert_eq!(port.try_lock().iter_occupied().count(), 1);
    }

    #[test]
    fn test_occupied_latency_slot_blocks_issue() {
        let config = Arc::new(config::GPU::default());
        let mut unit = PipelinedSimdUnit::new(0, "sp".into(), None, 13, config);

        unit.issue(instr_with_latency(4));
        unit.cycle(0);
        // the dispatch register is free again, but the latency slot of a
        // second instruction finishing in the same cycle is claimed
        assert!(unit.dispatch_reg.is_none());
        assert!(!unit.can_issue(&instr_with_latency(3)));
        assert!(unit.can_issue(&instr_with_latency(4)));
    }
}
