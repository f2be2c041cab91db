/// Instruction mnemonics the timing model distinguishes.
///
/// The functional engine decodes the full instruction set; the timing side
/// only special-cases control flow, barriers and memory operations, so this
/// list carries the mnemonics those paths match on plus a representative
/// set of ALU and SFU operations.
#[allow(clippy::upper_case_acronyms)]
#[derive(strum::AsRefStr, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    NOP,
    // memory
    LD,
    LDC,
    LDG,
    LDL,
    LDS,
    ST,
    STG,
    STL,
    STS,
    ATOM,
    RED,
    MEMBAR,
    TEX,
    // alu
    IADD,
    IMAD,
    IMUL,
    ISETP,
    MOV,
    SEL,
    SHFL,
    S2R,
    VOTE,
    FADD,
    FMUL,
    FFMA,
    FSETP,
    DADD,
    DMUL,
    DFMA,
    // sfu
    MUFU,
    RCP,
    SQRT,
    SIN,
    // control
    BRA,
    BRX,
    JMP,
    CALL,
    RET,
    SSY,
    BAR,
    EXIT,
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Architectural operation category, deciding which pipeline an
/// instruction issues into.
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(
    Debug,
    strum::EnumIter,
    strum::EnumCount,
    strum::FromRepr,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
)]
#[repr(usize)]
pub enum ArchOp {
    NO_OP,
    ALU_OP,
    SFU_OP,
    /// Double precision
    DP_OP,
    /// Single precision
    SP_OP,
    INT_OP,
    /// May issue to either the SP or the SFU pipeline.
    ALU_SFU_OP,
    LOAD_OP,
    STORE_OP,
    BRANCH_OP,
    BARRIER_OP,
    MEMORY_BARRIER_OP,
    CALL_OPS,
    RET_OPS,
    EXIT_OPS,
}

impl ArchOp {
    #[must_use]
    pub fn is_memory(self) -> bool {
        matches!(
            self,
            ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP
        )
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Opcode {
    pub op: Op,
    pub category: ArchOp,
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.op)
    }
}
