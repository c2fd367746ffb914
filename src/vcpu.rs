use std::any::Any;
use std::fmt;

/// Number of general-purpose registers tracked by the tag file
pub const GPR_NUM: usize = 8;

/// Taint bit of the lowest byte (AL, BL, ...)
pub const VCPU_MASK8: u32 = 0x1;
/// Taint bit of the second byte (AH, BH, ...)
pub const VCPU_MASK8_UPPER: u32 = VCPU_MASK8 << 1;
/// Taint bits of the 16-bit view (AX, BX, ...)
pub const VCPU_MASK16: u32 = 0x3;
/// Taint bits of the full 32-bit register
pub const VCPU_MASK32: u32 = 0xf;

/// Slots of the tag file. The order is fixed and doubles as the layout used
/// by `pusha`/`popa`.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
pub enum Gpr {
    Edi = 0,
    Esi = 1,
    Ebp = 2,
    Esp = 3,
    Ebx = 4,
    Edx = 5,
    Ecx = 6,
    Eax = 7,
    /// Not a real register; holds taint across multi-step exchanges
    Scratch = 8,
}

impl Gpr {
    /// The eight architectural registers, in slot order
    pub const ALL: [Gpr; GPR_NUM] = [
        Gpr::Edi,
        Gpr::Esi,
        Gpr::Ebp,
        Gpr::Esp,
        Gpr::Ebx,
        Gpr::Edx,
        Gpr::Ecx,
        Gpr::Eax,
    ];

    /// Slot for a raw index; anything out of range lands in `Scratch`
    pub fn from_index(index: usize) -> Self {
        Self::ALL.get(index).copied().unwrap_or(Gpr::Scratch)
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Which part of a register an operand refers to
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum View {
    /// AL, BL, CL, DL
    Lower8,
    /// AH, BH, CH, DH
    Upper8,
    /// AX, BX, ...
    Word,
    /// EAX, EBX, ...
    Long,
}

impl View {
    /// Bits of the taint word this view occupies
    pub fn mask(self) -> u32 {
        match self {
            View::Lower8 => VCPU_MASK8,
            View::Upper8 => VCPU_MASK8_UPPER,
            View::Word => VCPU_MASK16,
            View::Long => VCPU_MASK32,
        }
    }

    /// Position of the view's lowest byte inside the taint word
    pub fn shift(self) -> u32 {
        match self {
            View::Upper8 => 1,
            _ => 0,
        }
    }

    /// Operand size in bytes
    pub fn width(self) -> usize {
        match self {
            View::Lower8 | View::Upper8 => 1,
            View::Word => 2,
            View::Long => 4,
        }
    }
}

/// A register operand as the tag file sees it: a slot and a view into it
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct RegOperand {
    pub slot: Gpr,
    pub view: View,
}

impl RegOperand {
    pub fn new(slot: Gpr, view: View) -> Self {
        Self { slot, view }
    }

    pub fn width(self) -> usize {
        self.view.width()
    }
}

impl fmt::Display for RegOperand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}.{:?}", self.slot, self.view)
    }
}

/// Per-thread register taint: one word per GPR plus the scratch slot.
///
/// Bits 0..4 of each word hold the taint of the register's four bytes,
/// lowest byte first. Writes through a view never touch bits outside it.
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct Vcpu {
    gpr: [u32; GPR_NUM + 1],
}

impl Vcpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw taint word of a slot
    pub fn word(&self, slot: Gpr) -> u32 {
        self.gpr[slot.index()]
    }

    /// Overwrite the raw taint word of a slot
    pub fn set_word(&mut self, slot: Gpr, word: u32) {
        self.gpr[slot.index()] = word & VCPU_MASK32;
    }

    /// Taint bits of `reg`, right-aligned: bit 0 is the view's lowest byte
    pub fn get(&self, reg: RegOperand) -> u32 {
        (self.word(reg.slot) & reg.view.mask()) >> reg.view.shift()
    }

    /// Replace the taint bits of `reg` with the right-aligned `value`
    pub fn set(&mut self, reg: RegOperand, value: u32) {
        let mask = reg.view.mask();
        let slot = &mut self.gpr[reg.slot.index()];
        *slot = (*slot & !mask) | ((value << reg.view.shift()) & mask);
    }

    /// OR the right-aligned `value` into the taint bits of `reg`
    pub fn merge(&mut self, reg: RegOperand, value: u32) {
        let mask = reg.view.mask();
        self.gpr[reg.slot.index()] |= (value << reg.view.shift()) & mask;
    }

    pub fn clear(&mut self, reg: RegOperand) {
        self.gpr[reg.slot.index()] &= !reg.view.mask();
    }

    pub fn clear_reg32(&mut self, slot: Gpr) {
        self.clear(RegOperand::new(slot, View::Long))
    }

    pub fn clear_reg16(&mut self, slot: Gpr) {
        self.clear(RegOperand::new(slot, View::Word))
    }

    pub fn clear_byte_upper(&mut self, slot: Gpr) {
        self.clear(RegOperand::new(slot, View::Upper8))
    }

    pub fn clear_byte_lower(&mut self, slot: Gpr) {
        self.clear(RegOperand::new(slot, View::Lower8))
    }

    /// Clear EAX, EBX, ECX and EDX in one step (`cpuid`)
    pub fn clear_eax_edx_ecx_ebx(&mut self) {
        for slot in &[Gpr::Ebx, Gpr::Edx, Gpr::Ecx, Gpr::Eax] {
            self.gpr[slot.index()] = 0;
        }
    }

    /// Clear EAX and EDX in one step (`rdtsc`, `rdpmc`)
    pub fn clear_eax_edx(&mut self) {
        self.gpr[Gpr::Edx.index()] = 0;
        self.gpr[Gpr::Eax.index()] = 0;
    }

    /// Is any byte of any architectural register tainted
    pub fn any_tainted(&self) -> bool {
        Gpr::ALL.iter().any(|&slot| self.word(slot) != 0)
    }
}

/// Number of syscall arguments recorded in a `SyscallContext`
pub const SYSCALL_ARG_NUM: usize = 6;

/// The most recent system call made by a thread, as seen by the host
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct SyscallContext {
    pub nr: i32,
    pub args: [u32; SYSCALL_ARG_NUM],
    pub ret: u32,
}

/// Everything the engine keeps per monitored thread
#[derive(Default)]
pub struct ThreadContext {
    pub vcpu: Vcpu,
    pub syscall: SyscallContext,
    /// Thread-local storage for whatever embeds the engine
    pub local: Option<Box<dyn Any + Send>>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("vcpu", &self.vcpu)
            .field("syscall", &self.syscall)
            .field("local", &self.local.is_some())
            .finish()
    }
}
