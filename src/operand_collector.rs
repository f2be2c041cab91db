use crate::sync::{Arc, Mutex};
use crate::{
    config,
    core::PipelineStage,
    instruction::WarpInstruction,
    register_set::{self, RegisterSet},
    UniqueWarpKey,
};
use bitvec::BitArr;
use std::collections::HashMap;
use std::collections::VecDeque;

pub const MAX_SRC_OPERANDS: usize = 8;

pub type OperandSlots = BitArr!(for MAX_SRC_OPERANDS);

pub type Ref = Arc<Mutex<RegisterFileUnit>>;

/// Deterministic, stateless register-to-bank mapping.
#[must_use]
pub fn register_bank(reg: u32, warp_id: usize, num_banks: usize, warp_shift: bool) -> usize {
    let mut bank = reg as usize;
    if warp_shift {
        bank += warp_id;
    }
    bank % num_banks
}

/// Collector unit sets, one per destination pipeline.
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Debug, strum::EnumIter, strum::EnumCount, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Kind {
    SP_CUS,
    SFU_CUS,
    MEM_CUS,
    GEN_CUS,
}

/// One pending register read on behalf of a collector unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOperand {
    pub collector_unit_id: usize,
    /// Operand slot within the collector unit.
    pub operand: usize,
    pub register: u32,
    pub bank: usize,
    pub warp_id: usize,
}

/// One register write competing for a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationOperand {
    pub register: u32,
    pub bank: usize,
    pub warp_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Allocation {
    #[default]
    None,
    Read(SourceOperand),
    Write(DestinationOperand),
}

impl Allocation {
    #[must_use]
    pub fn is_free(&self) -> bool {
        matches!(self, Allocation::None)
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Allocation::Write(_))
    }
}

/// Per-cycle matching of bank requests to collector units.
///
/// Reads are granted by wavefront (diagonal) matching with a rotating
/// collector priority: at most one grant per bank and one per collector
/// per cycle, and a bank already claimed by a write this cycle grants no
/// read. Ungranted requests stay queued for the next cycle.
#[derive(Debug)]
pub struct Arbiter {
    num_banks: usize,
    num_collectors: usize,
    requests: Vec<VecDeque<SourceOperand>>,
    allocated_banks: Vec<Allocation>,
    cu_priority: usize,
}

impl Arbiter {
    #[must_use]
    pub fn new(num_banks: usize, num_collectors: usize) -> Self {
        assert!(num_banks > 0);
        assert!(num_collectors > 0);
        Self {
            num_banks,
            num_collectors,
            requests: vec![VecDeque::new(); num_banks],
            allocated_banks: vec![Allocation::None; num_banks],
            cu_priority: 0,
        }
    }

    pub fn add_read_requests(&mut self, cu: &CollectorUnit) {
        for op in cu.src_operands.iter().flatten() {
            self.requests[op.bank].push_back(*op);
        }
    }

    /// Drop a queued read that was satisfied by other means.
    pub fn remove_request(&mut self, op: &SourceOperand) {
        self.requests[op.bank].retain(|pending| {
            !(pending.collector_unit_id == op.collector_unit_id && pending.operand == op.operand)
        });
    }

    #[must_use]
    pub fn bank_idle(&self, bank: usize) -> bool {
        self.allocated_banks[bank].is_free()
    }

    pub fn allocate_bank_for_write(&mut self, bank: usize, op: DestinationOperand) {
        debug_assert!(self.bank_idle(bank));
        self.allocated_banks[bank] = Allocation::Write(op);
    }

    /// Conflict-free read grants for this cycle.
    pub fn allocate_reads(&mut self) -> Vec<SourceOperand> {
        let num_inputs = self.num_banks;
        let num_outputs = self.num_collectors;
        let square = num_inputs.max(num_outputs);

        let mut inmatch: Vec<Option<usize>> = vec![None; num_inputs];
        let mut outmatch: Vec<Option<usize>> = vec![None; num_outputs];

        // banks claimed by writes are pre-matched, giving writes priority
        for bank in 0..num_inputs {
            if self.allocated_banks[bank].is_write() {
                inmatch[bank] = Some(num_outputs);
            }
        }

        for p in 0..square {
            let mut output = (self.cu_priority + p) % num_outputs;
            for input in 0..num_inputs {
                if inmatch[input].is_none()
                    && outmatch[output].is_none()
                    && self.requests[input]
                        .iter()
                        .any(|op| op.collector_unit_id == output)
                {
                    inmatch[input] = Some(output);
                    outmatch[output] = Some(input);
                }
                output = (output + 1) % num_outputs;
            }
        }

        let mut granted = Vec::new();
        for (bank, matched) in inmatch.iter().enumerate() {
            let Some(output) = matched else {
                continue;
            };
            if *output >= num_outputs {
                // write pre-match
                continue;
            }
            let Some(pos) = self.requests[bank]
                .iter()
                .position(|op| op.collector_unit_id == *output)
            else {
                continue;
            };
            let op = self.requests[bank].remove(pos).unwrap_or_else(|| {
                unreachable!("request position was just found")
            });
            self.allocated_banks[bank] = Allocation::Read(op);
            granted.push(op);
        }

        self.cu_priority = (self.cu_priority + 1) % self.num_collectors;
        granted
    }

    /// Release all per-cycle bank claims.
    pub fn reset_allocation(&mut self) {
        self.allocated_banks.fill(Allocation::None);
    }

    #[must_use]
    pub fn pending_reads(&self, bank: usize) -> usize {
        self.requests[bank].len()
    }
}

/// Transient holder for one instruction while its source operands are
/// read from the register banks.
#[derive(Debug)]
pub struct CollectorUnit {
    pub id: usize,
    pub kind: Kind,
    pub warp_instr: Option<WarpInstruction>,
    pub output_register: PipelineStage,
    pub src_operands: [Option<SourceOperand>; MAX_SRC_OPERANDS],
    pub not_ready: OperandSlots,
}

impl CollectorUnit {
    #[must_use]
    fn new(id: usize, kind: Kind) -> Self {
        Self {
            id,
            kind,
            warp_instr: None,
            output_register: PipelineStage::OC_EX_SP,
            src_operands: [None; MAX_SRC_OPERANDS],
            not_ready: OperandSlots::ZERO,
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.warp_instr.is_none()
    }

    #[must_use]
    pub fn key(&self) -> Option<UniqueWarpKey> {
        self.warp_instr.as_ref().map(WarpInstruction::unique_key)
    }

    /// All source operands collected.
    #[must_use]
    pub fn collected(&self) -> bool {
        !self.is_free() && self.not_ready.not_any()
    }

    /// Bind the ready instruction of `input` to this unit and turn its
    /// source registers into pending bank requests.
    pub fn allocate(
        &mut self,
        input: &mut RegisterSet,
        output_register: PipelineStage,
        num_banks: usize,
        warp_shift: bool,
    ) {
        debug_assert!(self.is_free());
        let Some(instr) = input.take_ready() else {
            panic!("collector unit {}: allocate without ready instruction", self.id);
        };
        self.output_register = output_register;
        self.src_operands = [None; MAX_SRC_OPERANDS];
        self.not_ready = OperandSlots::ZERO;
        for (slot, reg) in instr.src_regs().enumerate() {
            debug_assert!(slot < MAX_SRC_OPERANDS);
            self.src_operands[slot] = Some(SourceOperand {
                collector_unit_id: self.id,
                operand: slot,
                register: reg,
                bank: register_bank(reg, instr.warp_id, num_banks, warp_shift),
                warp_id: instr.warp_id,
            });
            self.not_ready.set(slot, true);
        }
        self.warp_instr = Some(instr);
    }

    pub fn collect_operand(&mut self, operand: usize) {
        debug_assert!(self.not_ready[operand]);
        self.not_ready.set(operand, false);
    }

    fn dispatch(&mut self) -> WarpInstruction {
        debug_assert!(self.not_ready.not_any());
        self.src_operands = [None; MAX_SRC_OPERANDS];
        let Some(instr) = self.warp_instr.take() else {
            panic!("collector unit {}: dispatch while free", self.id);
        };
        instr
    }
}

/// Round-robin selection of a ready collector unit within one set.
#[derive(Debug)]
pub struct DispatchUnit {
    pub kind: Kind,
    last_cu: usize,
}

impl DispatchUnit {
    #[must_use]
    fn new(kind: Kind) -> Self {
        Self { kind, last_cu: 0 }
    }
}

/// Pipeline register stages feeding (and fed by) one collector port.
///
/// `in_ports[i]` pairs with `out_ports[i]`; an instruction entering from
/// `in_ports[i]` dispatches into `out_ports[i]`.
#[derive(Debug, Clone)]
pub struct InputPort {
    pub in_ports: Vec<PipelineStage>,
    pub out_ports: Vec<PipelineStage>,
    pub collector_unit_sets: Vec<Kind>,
}

/// Pre-writeback register file access stage: staged operand reads over
/// banked register files with conflict arbitration.
pub struct RegisterFileUnit {
    pub config: Arc<config::GPU>,
    pub num_banks: usize,
    bank_warp_shift: bool,
    pub arbiter: Arbiter,
    pub in_ports: Vec<InputPort>,
    pub collector_units: Vec<CollectorUnit>,
    collector_sets: HashMap<Kind, Vec<usize>>,
    pub dispatch_units: Vec<DispatchUnit>,
    pipeline_reg: HashMap<PipelineStage, register_set::Ref>,
    /// Bank row activations; reads are lane-group granular when
    /// clock-gated accounting is configured.
    pub num_bank_reads: u64,
    pub num_bank_writes: u64,
}

/// Drain point for completed instructions: every destination register
/// must win a bank write slot before the instruction may retire.
pub trait Writeback {
    /// Attempt to allocate bank writes for all remaining destinations.
    ///
    /// Destinations that win a slot are cleared from the instruction, so
    /// a retry after `false` only competes for the banks it still needs.
    fn writeback(&mut self, instr: &mut WarpInstruction) -> bool;
}

impl RegisterFileUnit {
    #[must_use]
    pub fn new(config: Arc<config::GPU>) -> Self {
        let num_banks = config.num_reg_banks;
        let bank_warp_shift = config.reg_bank_warp_shift;
        Self {
            config,
            num_banks,
            bank_warp_shift,
            arbiter: Arbiter::new(num_banks, 1),
            in_ports: Vec::new(),
            collector_units: Vec::new(),
            collector_sets: HashMap::new(),
            dispatch_units: Vec::new(),
            pipeline_reg: HashMap::new(),
            num_bank_reads: 0,
            num_bank_writes: 0,
        }
    }

    pub fn add_cu_set(&mut self, kind: Kind, num_collector_units: usize, num_dispatch_units: usize) {
        let set = self.collector_sets.entry(kind).or_default();
        for _ in 0..num_collector_units {
            let id = self.collector_units.len();
            set.push(id);
            self.collector_units.push(CollectorUnit::new(id, kind));
        }
        for _ in 0..num_dispatch_units {
            self.dispatch_units.push(DispatchUnit::new(kind));
        }
    }

    pub fn add_port(
        &mut self,
        in_ports: Vec<PipelineStage>,
        out_ports: Vec<PipelineStage>,
        collector_unit_sets: Vec<Kind>,
    ) {
        debug_assert_eq!(in_ports.len(), out_ports.len());
        self.in_ports.push(InputPort {
            in_ports,
            out_ports,
            collector_unit_sets,
        });
    }

    /// Wire the pipeline register stages and size the arbiter; must run
    /// after every `add_cu_set` and `add_port`.
    pub fn init(&mut self, pipeline_reg: HashMap<PipelineStage, register_set::Ref>) {
        assert!(
            !self.collector_units.is_empty(),
            "operand collector: no collector units configured"
        );
        self.arbiter = Arbiter::new(self.num_banks, self.collector_units.len());
        self.pipeline_reg = pipeline_reg;
    }

    /// One register file cycle: drain ready collector units, grant bank
    /// reads, then admit new instructions from the input ports.
    pub fn step(&mut self, cycle: u64) {
        self.dispatch_ready_cu(cycle);
        self.allocate_reads();
        for port_idx in 0..self.in_ports.len() {
            self.allocate_cu(port_idx, cycle);
        }
        self.arbiter.reset_allocation();
    }

    fn read_cost(&self, instr: &WarpInstruction) -> u64 {
        match self.config.regfile_gating_group {
            Some(group) if group > 0 => {
                let active = instr.active_count();
                ((active + group - 1) / group) as u64
            }
            _ => 1,
        }
    }

    fn allocate_reads(&mut self) {
        let granted = self.arbiter.allocate_reads();
        for op in granted {
            let cost = self
                .collector_units[op.collector_unit_id]
                .warp_instr
                .as_ref()
                .map_or(1, |instr| self.read_cost(instr));
            self.num_bank_reads += cost;
            self.collector_units[op.collector_unit_id].collect_operand(op.operand);
            if self.config.operand_collector_broadcast {
                self.broadcast(op);
            }
        }
    }

    /// Satisfy identical reads of sibling fragments with this grant.
    ///
    /// Fragments of one issue group read the same register file state
    /// this cycle, so a sibling collector unit waiting on the same
    /// architectural register collects it for free and withdraws its
    /// bank request.
    fn broadcast(&mut self, op: SourceOperand) {
        let Some(key) = self.collector_units[op.collector_unit_id].key() else {
            return;
        };
        let mut satisfied = Vec::new();
        for cu in &self.collector_units {
            if cu.id == op.collector_unit_id || cu.key() != Some(key) {
                continue;
            }
            for sibling_op in cu.src_operands.iter().flatten() {
                if cu.not_ready[sibling_op.operand] && sibling_op.register == op.register {
                    satisfied.push(*sibling_op);
                }
            }
        }
        for sibling_op in satisfied {
            self.collector_units[sibling_op.collector_unit_id].collect_operand(sibling_op.operand);
            self.arbiter.remove_request(&sibling_op);
        }
    }

    /// Distinct issue groups resident in one collector unit set.
    fn resident_keys(&self, kind: Kind) -> Vec<UniqueWarpKey> {
        let Some(set) = self.collector_sets.get(&kind) else {
            return Vec::new();
        };
        let mut keys: Vec<UniqueWarpKey> = set
            .iter()
            .filter_map(|&idx| self.collector_units[idx].key())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    fn allocate_cu(&mut self, port_idx: usize, cycle: u64) {
        let port = self.in_ports[port_idx].clone();
        for (input_idx, stage) in port.in_ports.iter().enumerate() {
            let Some(input_reg) = self.pipeline_reg.get(stage) else {
                continue;
            };
            let key = {
                let input = input_reg.try_lock();
                let Some(ready) = input.get_ready() else {
                    continue;
                };
                ready.unique_key()
            };

            for kind in &port.collector_unit_sets {
                let Some(set) = self.collector_sets.get(kind) else {
                    continue;
                };
                let cap = self.config.max_unique_warps(set.len());
                let resident = self.resident_keys(*kind);
                if !resident.contains(&key) && resident.len() >= cap {
                    continue;
                }
                let Some(&free_idx) = set
                    .iter()
                    .find(|&&idx| self.collector_units[idx].is_free())
                else {
                    continue;
                };
                let output = port.out_ports[input_idx];
                log::debug!(
                    "cycle {:02} operand collector: allocate cu {} ({:?}) for warp {} -> {:?}",
                    cycle,
                    free_idx,
                    kind,
                    key.0,
                    output,
                );
                {
                    let mut input = input_reg.try_lock();
                    self.collector_units[free_idx].allocate(
                        &mut input,
                        output,
                        self.num_banks,
                        self.bank_warp_shift,
                    );
                }
                self.arbiter.add_read_requests(&self.collector_units[free_idx]);
                // one input serviced per port per cycle
                return;
            }
        }
    }

    /// All resident fragments of `key` have their operands collected.
    fn issue_group_collected(&self, key: UniqueWarpKey) -> bool {
        self.collector_units
            .iter()
            .filter(|cu| cu.key() == Some(key))
            .all(CollectorUnit::collected)
    }

    fn collector_unit_ready(&self, cu_idx: usize) -> bool {
        let cu = &self.collector_units[cu_idx];
        if !cu.collected() {
            return false;
        }
        let Some(key) = cu.key() else {
            return false;
        };
        let Some(output_reg) = self.pipeline_reg.get(&cu.output_register) else {
            return false;
        };
        let output = output_reg.try_lock();
        let max_unique = self.config.max_unique_warps(output.size());
        if !output.can_accept(key, max_unique) {
            return false;
        }
        if self.config.operand_collector_wait_all_fragments && !self.issue_group_collected(key) {
            return false;
        }
        true
    }

    fn dispatch_ready_cu(&mut self, cycle: u64) {
        for du_idx in 0..self.dispatch_units.len() {
            let kind = self.dispatch_units[du_idx].kind;
            let Some(set) = self.collector_sets.get(&kind).cloned() else {
                continue;
            };
            let last = self.dispatch_units[du_idx].last_cu;
            let found = (0..set.len())
                .map(|i| set[(last + 1 + i) % set.len()])
                .find(|&cu_idx| self.collector_unit_ready(cu_idx));
            let Some(cu_idx) = found else {
                continue;
            };
            self.dispatch_units[du_idx].last_cu = set
                .iter()
                .position(|&idx| idx == cu_idx)
                .unwrap_or(0);
            let instr = self.collector_units[cu_idx].dispatch();
            let output = self.collector_units[cu_idx].output_register;
            log::debug!(
                "cycle {:02} operand collector: dispatch cu {} warp {} -> {:?}",
                cycle,
                cu_idx,
                instr.warp_id,
                output,
            );
            if let Some(output_reg) = self.pipeline_reg.get(&output) {
                output_reg.try_lock().move_in_from(Some(instr));
            }
        }
    }
}

impl Writeback for RegisterFileUnit {
    fn writeback(&mut self, instr: &mut WarpInstruction) -> bool {
        for slot in 0..instr.outputs.len() {
            let Some(reg) = instr.outputs[slot] else {
                continue;
            };
            let bank = register_bank(reg, instr.warp_id, self.num_banks, self.bank_warp_shift);
            if self.arbiter.bank_idle(bank) {
                self.arbiter.allocate_bank_for_write(
                    bank,
                    DestinationOperand {
                        register: reg,
                        bank,
                        warp_id: instr.warp_id,
                    },
                );
                instr.outputs[slot] = None;
                self.num_bank_writes += 1;
            } else {
                return false;
            }
        }
        true
    }
}
