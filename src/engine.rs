use crate::sync::{Arc, Mutex};
use crate::{address, instruction::WarpInstruction};
use std::collections::HashMap;

pub type Ref = Arc<Mutex<Box<dyn FunctionalEngine>>>;

/// Functional side of the machine.
///
/// Decodes instructions for the timing model and computes their lane
/// outcomes at issue, which is when a load or store populates its access
/// queue. The timing model never inspects register values.
pub trait FunctionalEngine: Send + Sync + 'static {
    /// The decoded instruction at `pc`, or `None` past the end of the
    /// program.
    fn fetch_decoded_instruction(&self, pc: address) -> Option<WarpInstruction>;

    /// Functionally execute an issued instruction.
    fn execute(&mut self, instr: &mut WarpInstruction);
}

/// Program stored as a PC-indexed instruction table.
///
/// Execution is a no-op beyond handing out clones, which is all
/// straight-line timing experiments need.
#[derive(Debug, Default)]
pub struct TableEngine {
    instructions: HashMap<address, WarpInstruction>,
}

impl TableEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instr: WarpInstruction) {
        self.instructions.insert(instr.pc, instr);
    }
}

impl FunctionalEngine for TableEngine {
    fn fetch_decoded_instruction(&self, pc: address) -> Option<WarpInstruction> {
        self.instructions.get(&pc).cloned()
    }

    fn execute(&mut self, _instr: &mut WarpInstruction) {}
}
