use crate::call::AnalysisCall;
use crate::register::Register;

/// Condition codes of `cmovcc` and `setcc`
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Condition {
    B, Be, L, Le, Nb, Nbe, Nl, Nle, No, Np, Ns, Nz, O, P, S, Z,
}

/// Instruction classes the dispatcher distinguishes.
///
/// Hosts map their own opcode space onto this; anything else is `Other`,
/// and opcodes the decoder could not make sense of are `Invalid`.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Opcode {
    Adc, Add, And, Or, Xor, Sbb, Sub,
    Bsf, Bsr, Mov,
    Cmov(Condition),
    Cbw, Cwd, Cwde, Cdq,
    Movsx, Movzx,
    Div, Idiv, Mul, Imul,
    Set(Condition),
    Stmxcsr, Smsw, Str, Lar, Rdpmc, Rdtsc, Cpuid, Lahf, Salc,
    Cmpxchg, Cmpxchg8b, Xchg, Xadd,
    Lea, Xlat,
    Lodsb, Lodsw, Lodsd,
    Stosb, Stosw, Stosd,
    Movsb, Movsw, Movsd,
    Rcl, Rcr, Rol, Ror, Shl, Sar, Shr, Shld, Shrd,
    Pop, Push, Popa, Popad, Pusha, Pushad, Pushf, Pushfd,
    CallNear, Leave, Enter,
    Other(u32),
    Invalid,
}

impl Opcode {
    pub fn is_shift_or_rotate(self) -> bool {
        use Opcode::*;
        matches!(self, Rcl | Rcr | Rol | Ror | Shl | Sar | Shr | Shld | Shrd)
    }
}

/// What an explicit operand is
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum OperandKind {
    Reg(Register),
    Mem,
    Imm,
    /// Anything else (branch displacements, pointers, ...)
    Other,
}

/// The host instrumentation engine, as the dispatcher sees it.
///
/// Operands are numbered the way Intel syntax lists them: operand 0 is the
/// destination of two-operand forms, and the explicit source of one-operand
/// `mul`/`div`. Implicit operands (the accumulator of `mul`, the stack
/// pointer of `push`) come after the explicit ones.
pub trait Executer {
    /// The host's decoded-instruction handle
    type Ins: ?Sized;

    fn opcode(&self, ins: &Self::Ins) -> Opcode;

    fn operand_count(&self, ins: &Self::Ins) -> usize;

    /// `OperandKind::Other` if there is no operand `n`
    fn operand_kind(&self, ins: &Self::Ins, n: usize) -> OperandKind;

    /// Width of operand `n` in bytes
    fn operand_width(&self, ins: &Self::Ins, n: usize) -> usize;

    fn operand_is_implicit(&self, ins: &Self::Ins, n: usize) -> bool;

    fn memory_operand_count(&self, ins: &Self::Ins) -> usize;

    /// Bytes read or written by the memory access of a single-access
    /// instruction (`push imm`, `leave`, ...)
    fn memory_size(&self, ins: &Self::Ins) -> usize;

    fn memory_base_reg(&self, ins: &Self::Ins) -> Option<Register>;

    fn memory_index_reg(&self, ins: &Self::Ins) -> Option<Register>;

    fn has_rep_prefix(&self, ins: &Self::Ins) -> bool;

    /// ECX or CX, depending on the address size
    fn rep_count_register(&self, ins: &Self::Ins) -> Register;

    /// Human-readable form of the instruction, for diagnostics
    fn disassemble(&self, ins: &Self::Ins) -> String;

    /// Arrange for `call` to run at every execution of `ins`
    fn insert_call(&mut self, ins: &Self::Ins, call: AnalysisCall);

    fn operand_reg(&self, ins: &Self::Ins, n: usize) -> Option<Register> {
        match self.operand_kind(ins, n) {
            OperandKind::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    fn operand_is_memory(&self, ins: &Self::Ins, n: usize) -> bool {
        self.operand_kind(ins, n) == OperandKind::Mem
    }

    fn operand_is_immediate(&self, ins: &Self::Ins, n: usize) -> bool {
        self.operand_kind(ins, n) == OperandKind::Imm
    }
}
