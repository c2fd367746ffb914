use crate::propagation as prop;
use crate::register::Register;
use crate::tagmap::TagMap;
use crate::vcpu::{RegOperand, ThreadContext};
use either::Either;
use itertools::Itertools;
use std::fmt;

/// A run-time value the host must supply when it invokes an analysis call.
///
/// The thread context is always passed implicitly, and values known at
/// instrumentation time (register slots, widths) are bound directly into the
/// `Propagation` variant.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Binding {
    /// Effective address of the memory operand being read
    MemoryReadEa,
    /// Effective address of the memory operand being written
    MemoryWriteEa,
    /// Current value of a register
    RegValue(Register),
    /// Current value of the `width` bytes at the read effective address
    MemoryValue { width: usize },
    /// Whether this is the first iteration of a `rep`-prefixed instruction
    FirstRepIteration,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Binding::MemoryReadEa => write!(f, "read_ea"),
            Binding::MemoryWriteEa => write!(f, "write_ea"),
            Binding::RegValue(reg) => write!(f, "value({:?})", reg),
            Binding::MemoryValue { width } => write!(f, "mem{}(read_ea)", width * 8),
            Binding::FirstRepIteration => write!(f, "first_rep_iteration"),
        }
    }
}

/// Resolves `Binding`s when an analysis call runs. Implemented by the host.
pub trait Marshal {
    fn resolve(&self, binding: Binding) -> u32;

    /// Whether the instruction's own condition holds for this execution (the
    /// `cmov`/`setcc` condition, or "this `rep` iteration executes"). Only
    /// consulted for predicated calls.
    fn condition(&self) -> bool {
        true
    }
}

/// A memory operand: where it is, and how many bytes it covers
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct MemOperand {
    pub addr: Binding,
    pub width: usize,
}

impl MemOperand {
    pub fn read(width: usize) -> Self {
        Self { addr: Binding::MemoryReadEa, width }
    }

    pub fn write(width: usize) -> Self {
        Self { addr: Binding::MemoryWriteEa, width }
    }
}

/// One propagation rule with its static operands bound
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Propagation {
    ClearReg(RegOperand),
    /// `rdtsc`, `rdpmc`
    ClearEaxEdx,
    /// `cpuid`
    ClearEaxEdxEcxEbx,
    ClearMem(MemOperand),

    XferR2R { dst: RegOperand, src: RegOperand },
    XferM2R { dst: RegOperand, src: Binding },
    XferR2M { dst: Binding, src: RegOperand },
    XferM2M { dst: Binding, src: Binding, width: usize },
    /// `rep stos`
    XferR2MRep { dst: Binding, src: RegOperand, count: Binding, eflags: Binding },

    BinaryR2R { dst: RegOperand, src: RegOperand },
    BinaryM2R { dst: RegOperand, src: Binding },
    BinaryR2M { dst: Binding, src: RegOperand },

    /// Single-operand `mul`/`div`
    Ternary { src: Either<RegOperand, MemOperand> },

    /// `movsx`/`movzx`
    Extend { dst: RegOperand, src: Either<RegOperand, MemOperand> },
    Cwde,

    XchgR2R { dst: RegOperand, src: RegOperand },
    XchgM2R { reg: RegOperand, mem: Binding },

    XaddR2R { dst: RegOperand, src: RegOperand },
    XaddR2M { dst: Binding, src: RegOperand },

    CmpxchgFastR2R { dst: RegOperand, acc_value: Binding, dst_value: Binding },
    CmpxchgSlowR2R { dst: RegOperand, src: RegOperand },
    CmpxchgFastM2R { src: MemOperand, acc_value: Binding, mem_value: Binding },
    CmpxchgSlowR2M { dst: Binding, src: RegOperand },

    Lea { dst: RegOperand, base: Option<RegOperand>, index: Option<RegOperand> },

    /// `pusha`/`pushad`
    SaveAll { dst: Binding, width: usize },
    /// `popa`/`popad`
    RestoreAll { src: Binding, width: usize },

    RepPredicate { first: Binding },
}

impl Propagation {
    /// Run this rule against a thread's tag file and the shared tag map.
    ///
    /// Returns the predicate outcome for the rules that have one
    /// (`RepPredicate` and the compare-and-exchange fast paths), and `true`
    /// for everything else.
    pub fn apply<T, M>(&self, ctx: &mut ThreadContext, tags: &mut T, args: &M) -> bool
    where
        T: TagMap + ?Sized,
        M: Marshal + ?Sized,
    {
        let vcpu = &mut ctx.vcpu;
        match *self {
            Propagation::ClearReg(reg) => vcpu.clear(reg),
            Propagation::ClearEaxEdx => vcpu.clear_eax_edx(),
            Propagation::ClearEaxEdxEcxEbx => vcpu.clear_eax_edx_ecx_ebx(),
            Propagation::ClearMem(mem) => tags.clear(args.resolve(mem.addr), mem.width),

            Propagation::XferR2R { dst, src } => prop::r2r_xfer(vcpu, dst, src),
            Propagation::XferM2R { dst, src } => prop::m2r_xfer(vcpu, &*tags, dst, args.resolve(src)),
            Propagation::XferR2M { dst, src } => prop::r2m_xfer(tags, vcpu, args.resolve(dst), src),
            Propagation::XferM2M { dst, src, width } => {
                prop::m2m_xfer(tags, args.resolve(dst), args.resolve(src), width)
            },
            Propagation::XferR2MRep { dst, src, count, eflags } => prop::r2m_xfer_n(
                tags,
                vcpu,
                args.resolve(dst),
                src,
                args.resolve(count),
                args.resolve(eflags),
            ),

            Propagation::BinaryR2R { dst, src } => prop::r2r_binary(vcpu, dst, src),
            Propagation::BinaryM2R { dst, src } => prop::m2r_binary(vcpu, &*tags, dst, args.resolve(src)),
            Propagation::BinaryR2M { dst, src } => prop::r2m_binary(tags, vcpu, args.resolve(dst), src),

            Propagation::Ternary { src: Either::Left(reg) } => prop::r2r_ternary(vcpu, reg),
            Propagation::Ternary { src: Either::Right(mem) } => {
                prop::m2r_ternary(vcpu, &*tags, args.resolve(mem.addr), mem.width)
            },

            Propagation::Extend { dst, src: Either::Left(reg) } => prop::r2r_extend(vcpu, dst, reg),
            Propagation::Extend { dst, src: Either::Right(mem) } => {
                prop::m2r_extend(vcpu, &*tags, dst, args.resolve(mem.addr), mem.width)
            },
            Propagation::Cwde => prop::cwde(vcpu),

            Propagation::XchgR2R { dst, src } => prop::r2r_xchg(vcpu, dst, src),
            Propagation::XchgM2R { reg, mem } => prop::m2r_xchg(vcpu, tags, reg, args.resolve(mem)),

            Propagation::XaddR2R { dst, src } => prop::r2r_xadd(vcpu, dst, src),
            Propagation::XaddR2M { dst, src } => prop::r2m_xadd(vcpu, tags, args.resolve(dst), src),

            Propagation::CmpxchgFastR2R { dst, acc_value, dst_value } => {
                return prop::r2r_cmpxchg_fast(vcpu, dst, args.resolve(acc_value), args.resolve(dst_value));
            },
            Propagation::CmpxchgSlowR2R { dst, src } => prop::r2r_cmpxchg_slow(vcpu, dst, src),
            Propagation::CmpxchgFastM2R { src, acc_value, mem_value } => {
                return prop::m2r_cmpxchg_fast(
                    vcpu,
                    &*tags,
                    args.resolve(src.addr),
                    src.width,
                    args.resolve(acc_value),
                    args.resolve(mem_value),
                );
            },
            Propagation::CmpxchgSlowR2M { dst, src } => {
                prop::r2m_cmpxchg_slow(vcpu, tags, args.resolve(dst), src)
            },

            Propagation::Lea { dst, base, index } => prop::lea(vcpu, dst, base, index),

            Propagation::SaveAll { dst, width } => prop::save_all(tags, vcpu, args.resolve(dst), width),
            Propagation::RestoreAll { src, width } => prop::restore_all(vcpu, &*tags, args.resolve(src), width),

            Propagation::RepPredicate { first } => {
                return prop::rep_predicate(args.resolve(first) != 0);
            },
        }
        true
    }

    /// The run-time values this rule needs, in the order it consumes them
    pub fn bindings(&self) -> Vec<Binding> {
        match *self {
            Propagation::ClearMem(mem) => vec![mem.addr],
            Propagation::XferM2R { src, .. } => vec![src],
            Propagation::XferR2M { dst, .. } => vec![dst],
            Propagation::XferM2M { dst, src, .. } => vec![dst, src],
            Propagation::XferR2MRep { dst, count, eflags, .. } => vec![dst, count, eflags],
            Propagation::BinaryM2R { src, .. } => vec![src],
            Propagation::BinaryR2M { dst, .. } => vec![dst],
            Propagation::Ternary { src: Either::Right(mem) } => vec![mem.addr],
            Propagation::Extend { src: Either::Right(mem), .. } => vec![mem.addr],
            Propagation::XchgM2R { mem, .. } => vec![mem],
            Propagation::XaddR2M { dst, .. } => vec![dst],
            Propagation::CmpxchgFastR2R { acc_value, dst_value, .. } => vec![acc_value, dst_value],
            Propagation::CmpxchgFastM2R { src, acc_value, mem_value } => vec![src.addr, acc_value, mem_value],
            Propagation::CmpxchgSlowR2M { dst, .. } => vec![dst],
            Propagation::SaveAll { dst, .. } => vec![dst],
            Propagation::RestoreAll { src, .. } => vec![src],
            Propagation::RepPredicate { first } => vec![first],
            _ => Vec::new(),
        }
    }
}

/// How the host gates a call
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum CallMode {
    /// Every execution
    Always,
    /// Only when the instruction's condition holds
    Predicated,
    /// Every execution; the result gates the following `Then`
    If,
    /// Only when the preceding `If` returned true
    Then,
    /// `If`, but only when the instruction's condition holds
    IfPredicated,
    /// `Then`, but only when the instruction's condition holds
    ThenPredicated,
}

impl CallMode {
    pub fn is_predicated(self) -> bool {
        matches!(self, CallMode::Predicated | CallMode::IfPredicated | CallMode::ThenPredicated)
    }

    pub fn is_if(self) -> bool {
        matches!(self, CallMode::If | CallMode::IfPredicated)
    }

    pub fn is_then(self) -> bool {
        matches!(self, CallMode::Then | CallMode::ThenPredicated)
    }
}

/// What the dispatcher hands to `Executer::insert_call`. Every call runs
/// before the instruction it is attached to.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct AnalysisCall {
    pub mode: CallMode,
    pub op: Propagation,
}

impl AnalysisCall {
    pub fn new(mode: CallMode, op: Propagation) -> Self {
        Self {
            mode,
            op,
        }
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.op.bindings()
    }
}

impl fmt::Display for AnalysisCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} ({})",
            self.mode,
            self.op,
            self.bindings().iter().join(", ")
        )
    }
}
