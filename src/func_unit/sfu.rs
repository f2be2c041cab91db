use super::{PipelinedSimdUnit, SimdFunctionUnit};
use crate::sync::Arc;
use crate::{config, core::PipelineStage, instruction::WarpInstruction, opcodes::ArchOp, register_set};

/// Special function unit (transcendentals and their fallback traffic).
#[derive(Debug)]
pub struct SfuUnit {
    inner: PipelinedSimdUnit,
}

impl SfuUnit {
    #[must_use]
    pub fn new(id: usize, result_port: register_set::Ref, config: Arc<config::GPU>) -> Self {
        let depth = config.max_sfu_latency;
        Self {
            inner: PipelinedSimdUnit::new(
                id,
                format!("SfuUnit[{id}]"),
                Some(result_port),
                depth,
                config,
            ),
        }
    }
}

impl SimdFunctionUnit for SfuUnit {
    fn id(&self) -> &str {
        &self.inner.name
    }

    fn issue_port(&self) -> PipelineStage {
        PipelineStage::OC_EX_SFU
    }

    fn stallable(&self) -> bool {
        false
    }

    fn can_issue(&self, instr: &WarpInstruction) -> bool {
        match instr.opcode.category {
            ArchOp::SFU_OP | ArchOp::ALU_SFU_OP | ArchOp::DP_OP => self.inner.can_issue(instr),
            _ => false,
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
