use super::{PipelinedSimdUnit, SimdFunctionUnit};
use crate::sync::Arc;
use crate::{config, core::PipelineStage, instruction::WarpInstruction, opcodes::ArchOp, register_set};

/// General ALU pipeline (integer, single precision float, control flow).
#[derive(Debug)]
pub struct SPUnit {
    inner: PipelinedSimdUnit,
}

impl SPUnit {
    #[must_use]
    pub fn new(id: usize, result_port: register_set::Ref, config: Arc<config::GPU>) -> Self {
        let depth = config.max_sp_latency;
        Self {
            inner: PipelinedSimdUnit::new(
                id,
                format!("SPUnit[{id}]"),
                Some(result_port),
                depth,
                config,
            ),
        }
    }
}

impl SimdFunctionUnit for SPUnit {
    fn id(&self) -> &str {
        &self.inner.name
    }

    fn issue_port(&self) -> PipelineStage {
        PipelineStage::OC_EX_SP
    }

    fn stallable(&self) -> bool {
        false
    }

    fn can_issue(&self, instr: &WarpInstruction) -> bool {
        match instr.opcode.category {
            ArchOp::SFU_OP
            | ArchOp::DP_OP
            | ArchOp::LOAD_OP
            | ArchOp::STORE_OP
            | ArchOp::MEMORY_BARRIER_OP => false,
            _ => self.inner.can_issue(instr),
        }
    }

    fn issue(&mut self, instr: WarpInstruction) {
        debug_assert!(self.can_issue(&instr));
        self.inner.issue(instr);
    }

    fn cycle(&mut self, cycle: u64) {
        self.inner.cycle(cycle);
    }
}
