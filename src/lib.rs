//! Byte-granular dynamic taint tracking for 32-bit x86.
//!
//! A host instrumentation engine hands every static instruction to
//! `Engine::instrument` once. The engine picks the propagation rules for it
//! and registers them through the host's `Executer` implementation as
//! `AnalysisCall`s. At run time the host applies those calls, which move
//! taint between the per-thread `Vcpu` tag file and the shared `TagMap`.

mod call;
mod classifier;
mod config;
mod engine;
mod error;
mod executer;
pub mod propagation;
mod register;
mod tagmap;
mod vcpu;

pub use crate::call::{AnalysisCall, Binding, CallMode, Marshal, MemOperand, Propagation};
pub use crate::classifier::instrument;
pub use crate::config::{Config, UnhandledHandling};
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::executer::{Condition, Executer, Opcode, OperandKind};
pub use crate::register::Register;
pub use crate::tagmap::{width_mask, Bitmap, Direction, TagMap};
pub use crate::vcpu::{
    Gpr,
    RegOperand,
    SyscallContext,
    ThreadContext,
    Vcpu,
    View,
    GPR_NUM,
    SYSCALL_ARG_NUM,
    VCPU_MASK16,
    VCPU_MASK32,
    VCPU_MASK8,
    VCPU_MASK8_UPPER,
};
