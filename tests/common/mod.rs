#![allow(dead_code)]

use std::collections::HashMap;
use x86_dft::*;

pub fn init_logging() {
    // capture log messages with test harness
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A decoded instruction, as a host would describe it
#[derive(Clone, Debug)]
pub struct Ins {
    pub opcode: Opcode,
    /// explicit operands first, then implicit ones
    pub operands: Vec<(OperandKind, usize)>,
    pub explicit: usize,
    pub mem_size: usize,
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub rep: bool,
}

fn reg_width(reg: Register) -> usize {
    match reg.view() {
        Some(view) => view.width(),
        None if reg.is_seg() => 2,
        None => 4,
    }
}

impl Ins {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operands: Vec::new(),
            explicit: 0,
            mem_size: 0,
            base: None,
            index: None,
            rep: false,
        }
    }

    pub fn reg(mut self, reg: Register) -> Self {
        self.operands.push((OperandKind::Reg(reg), reg_width(reg)));
        self.explicit += 1;
        self
    }

    pub fn mem(mut self, width: usize) -> Self {
        self.operands.push((OperandKind::Mem, width));
        self.explicit += 1;
        self.mem_size = width;
        self
    }

    pub fn imm(mut self, width: usize) -> Self {
        self.operands.push((OperandKind::Imm, width));
        self.explicit += 1;
        self
    }

    pub fn implicit(mut self, reg: Register) -> Self {
        self.operands.push((OperandKind::Reg(reg), reg_width(reg)));
        self
    }

    /// A memory operand the instruction uses without naming it
    pub fn implicit_mem(mut self, width: usize) -> Self {
        self.operands.push((OperandKind::Mem, width));
        self
    }

    /// Size of the stack access of push/pop/leave style instructions
    pub fn stack(mut self, width: usize) -> Self {
        self.mem_size = width;
        self
    }

    pub fn base(mut self, reg: Register) -> Self {
        self.base = Some(reg);
        self
    }

    pub fn index(mut self, reg: Register) -> Self {
        self.index = Some(reg);
        self
    }

    pub fn rep(mut self) -> Self {
        self.rep = true;
        self
    }
}

/// Records every call the dispatcher attaches
#[derive(Default)]
pub struct MockExecuter {
    pub calls: Vec<AnalysisCall>,
}

impl Executer for MockExecuter {
    type Ins = Ins;

    fn opcode(&self, ins: &Ins) -> Opcode {
        ins.opcode
    }

    fn operand_count(&self, ins: &Ins) -> usize {
        ins.operands.len()
    }

    fn operand_kind(&self, ins: &Ins, n: usize) -> OperandKind {
        ins.operands.get(n).map_or(OperandKind::Other, |&(kind, _)| kind)
    }

    fn operand_width(&self, ins: &Ins, n: usize) -> usize {
        ins.operands.get(n).map_or(0, |&(_, width)| width)
    }

    fn operand_is_implicit(&self, ins: &Ins, n: usize) -> bool {
        n >= ins.explicit && n < ins.operands.len()
    }

    fn memory_operand_count(&self, ins: &Ins) -> usize {
        ins.operands.iter().filter(|(kind, _)| *kind == OperandKind::Mem).count()
    }

    fn memory_size(&self, ins: &Ins) -> usize {
        ins.mem_size
    }

    fn memory_base_reg(&self, ins: &Ins) -> Option<Register> {
        ins.base
    }

    fn memory_index_reg(&self, ins: &Ins) -> Option<Register> {
        ins.index
    }

    fn has_rep_prefix(&self, ins: &Ins) -> bool {
        ins.rep
    }

    fn rep_count_register(&self, _ins: &Ins) -> Register {
        Register::Ecx
    }

    fn disassemble(&self, ins: &Ins) -> String {
        format!("{:?} {:?}", ins.opcode, ins.operands)
    }

    fn insert_call(&mut self, _ins: &Ins, call: AnalysisCall) {
        self.calls.push(call);
    }
}

pub fn classify_with(config: &Config, ins: &Ins) -> Vec<AnalysisCall> {
    let mut exe = MockExecuter::default();
    instrument(&mut exe, ins, config);
    exe.calls
}

pub fn classify(ins: &Ins) -> Vec<AnalysisCall> {
    classify_with(&Config::default(), ins)
}

/// Run-time values for one execution of an instruction
pub struct Args {
    pub read_ea: u32,
    pub write_ea: u32,
    pub regs: HashMap<Register, u32>,
    pub mem_value: u32,
    pub first_iteration: bool,
    pub condition: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            read_ea: 0,
            write_ea: 0,
            regs: HashMap::new(),
            mem_value: 0,
            first_iteration: true,
            condition: true,
        }
    }
}

impl Args {
    pub fn read(mut self, ea: u32) -> Self {
        self.read_ea = ea;
        self
    }

    pub fn write(mut self, ea: u32) -> Self {
        self.write_ea = ea;
        self
    }

    pub fn value(mut self, reg: Register, value: u32) -> Self {
        self.regs.insert(reg, value);
        self
    }
}

impl Marshal for Args {
    fn resolve(&self, binding: Binding) -> u32 {
        match binding {
            Binding::MemoryReadEa => self.read_ea,
            Binding::MemoryWriteEa => self.write_ea,
            Binding::RegValue(reg) => self.regs.get(&reg).copied().unwrap_or(0),
            Binding::MemoryValue { .. } => self.mem_value,
            Binding::FirstRepIteration => self.first_iteration as u32,
        }
    }

    fn condition(&self) -> bool {
        self.condition
    }
}

/// An engine with a small address space, so tests don't allocate 512 MiB
pub fn small_engine() -> Engine {
    let mut config = Config::default();
    config.address_space = 1 << 16;
    Engine::init(config).unwrap_or_else(|e| panic!("Failed to initialize engine: {}", e))
}

/// Instrument `ins` and run its calls once
pub fn execute(engine: &mut Engine, ctx: &mut ThreadContext, ins: &Ins, args: &Args) {
    let mut exe = MockExecuter::default();
    engine.instrument(&mut exe, ins);
    engine.run(ctx, &exe.calls, args);
}

pub fn op(reg: Register) -> RegOperand {
    reg.operand().unwrap_or_else(|| panic!("{:?} is not a general-purpose register", reg))
}
