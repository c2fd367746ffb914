//! Per-instruction selection of propagation rules.
//!
//! `instrument` is called once per static instruction. It looks at the
//! opcode and operand shapes and hands zero or more `AnalysisCall`s to the
//! host, which runs them before every dynamic execution of the instruction.

use crate::call::{AnalysisCall, Binding, CallMode, MemOperand, Propagation};
use crate::config::{Config, UnhandledHandling};
use crate::executer::{Executer, Opcode};
use crate::register::Register;
use crate::vcpu::{Gpr, RegOperand, View};
use either::Either;
use log::{debug, warn};

const AL: RegOperand = RegOperand { slot: Gpr::Eax, view: View::Lower8 };
const AH: RegOperand = RegOperand { slot: Gpr::Eax, view: View::Upper8 };
const AX: RegOperand = RegOperand { slot: Gpr::Eax, view: View::Word };
const EAX: RegOperand = RegOperand { slot: Gpr::Eax, view: View::Long };
const DX: RegOperand = RegOperand { slot: Gpr::Edx, view: View::Word };
const EDX: RegOperand = RegOperand { slot: Gpr::Edx, view: View::Long };

/// Select and attach the propagation rules for `ins`
pub fn instrument<E: Executer>(exe: &mut E, ins: &E::Ins, config: &Config) {
    let opcode = exe.opcode(ins);
    let mut inspector = Inspector { exe, ins, config };
    if opcode == Opcode::Invalid {
        inspector.unhandled("invalid opcode");
        return;
    }
    if config.disabled.contains(&opcode) {
        debug!("{}: instrumentation disabled for {:?}", inspector.exe.disassemble(ins), opcode);
        return;
    }
    inspector.inspect(opcode);
}

struct Inspector<'a, E: Executer> {
    exe: &'a mut E,
    ins: &'a E::Ins,
    config: &'a Config,
}

impl<'a, E: Executer> Inspector<'a, E> {
    fn inspect(&mut self, opcode: Opcode) {
        use Opcode::*;
        match opcode {
            Adc | Add | And | Or | Xor | Sbb | Sub => self.binary(matches!(opcode, Xor | Sub | Sbb)),
            Bsf | Bsr | Mov => self.mov(),
            Cmov(_) => self.cmov(),
            Cbw => self.always(Propagation::XferR2R { dst: AH, src: AL }),
            Cwd => self.always(Propagation::XferR2R { dst: DX, src: AX }),
            Cwde => self.always(Propagation::Cwde),
            Cdq => self.always(Propagation::XferR2R { dst: EDX, src: EAX }),
            Movsx | Movzx => self.extend(),
            Div | Idiv | Mul => self.ternary(),
            Imul => self.imul(),
            Set(_) => self.setcc(),
            Stmxcsr => self.always(Propagation::ClearMem(MemOperand::write(4))),
            Smsw | Str => self.clear_operand(),
            Lar => self.clear_register(),
            Rdpmc | Rdtsc => self.always(Propagation::ClearEaxEdx),
            Cpuid => self.always(Propagation::ClearEaxEdxEcxEbx),
            Lahf => self.always(Propagation::ClearReg(AH)),
            Salc => self.always(Propagation::ClearReg(AL)),
            Cmpxchg => self.cmpxchg(),
            Xchg => self.xchg(),
            Xadd => self.xadd(),
            Lea => self.lea(),
            Xlat => self.always(Propagation::XferM2R { dst: AL, src: Binding::MemoryReadEa }),
            Lodsb => self.lods(AL),
            Lodsw => self.lods(AX),
            Lodsd => self.lods(EAX),
            Stosb => self.stos(AL),
            Stosw => self.stos(AX),
            Stosd => self.stos(EAX),
            Movsb => self.movs(1),
            Movsw => self.movs(2),
            Movsd => self.movs(4),
            Pop => self.pop(),
            Push => self.push(),
            Popa => self.always(Propagation::RestoreAll { src: Binding::MemoryReadEa, width: 2 }),
            Popad => self.always(Propagation::RestoreAll { src: Binding::MemoryReadEa, width: 4 }),
            Pusha => self.always(Propagation::SaveAll { dst: Binding::MemoryWriteEa, width: 2 }),
            Pushad => self.always(Propagation::SaveAll { dst: Binding::MemoryWriteEa, width: 4 }),
            Pushf => self.always(Propagation::ClearMem(MemOperand::write(2))),
            Pushfd => self.always(Propagation::ClearMem(MemOperand::write(4))),
            CallNear => {
                let width = self.stack_width(self.exe.operand_width(self.ins, 0));
                self.always(Propagation::ClearMem(MemOperand::write(width)))
            },
            Leave => self.leave(),
            Cmpxchg8b | Enter => self.unhandled("no propagation rule"),
            // shifts and rotates are deliberately left alone
            Rcl | Rcr | Rol | Ror | Shl | Sar | Shr | Shld | Shrd => {},
            Other(_) | Invalid => {},
        }
    }

    // ---- helpers ----

    fn attach(&mut self, mode: CallMode, op: Propagation) {
        let call = AnalysisCall::new(mode, op);
        debug!("{}: {}", self.exe.disassemble(self.ins), call);
        self.exe.insert_call(self.ins, call);
    }

    fn always(&mut self, op: Propagation) {
        self.attach(CallMode::Always, op)
    }

    fn predicated(&mut self, op: Propagation) {
        self.attach(CallMode::Predicated, op)
    }

    fn unhandled(&self, why: &str) {
        match self.config.unhandled {
            UnhandledHandling::Log => {
                warn!("{}: left uninstrumented ({})", self.exe.disassemble(self.ins), why)
            },
            UnhandledHandling::Ignore => {},
            UnhandledHandling::Panic => {
                panic!("{}: left uninstrumented ({})", self.exe.disassemble(self.ins), why)
            },
        }
    }

    fn is_mem(&self, n: usize) -> bool {
        self.exe.operand_is_memory(self.ins, n)
    }

    fn is_imm(&self, n: usize) -> bool {
        self.exe.operand_is_immediate(self.ins, n)
    }

    fn reg(&self, n: usize) -> Option<Register> {
        self.exe.operand_reg(self.ins, n)
    }

    /// Operand `n` as a general-purpose register, logging anything else
    fn gpr(&self, n: usize) -> Option<RegOperand> {
        let operand = self.reg(n).and_then(Register::operand);
        if operand.is_none() {
            self.unhandled("operand is not a general-purpose register");
        }
        operand
    }

    /// Both operands of a register/register form, if they agree in width
    /// and nothing touches memory
    fn gpr_pair(&self) -> Option<(RegOperand, RegOperand)> {
        if self.exe.memory_operand_count(self.ins) != 0 {
            self.unhandled("register form with a memory operand");
            return None;
        }
        let dst = self.gpr(0)?;
        let src = self.gpr(1)?;
        if dst.width() != src.width() {
            self.unhandled("register operands differ in width");
            return None;
        }
        Some((dst, src))
    }

    /// Stack slots are 2 or 4 bytes wide
    fn stack_width(&self, width: usize) -> usize {
        if width == 2 { 2 } else { 4 }
    }

    // ---- families ----

    /// add, sub, and, ...: t[dst] |= t[src]
    fn binary(&mut self, clears_itself: bool) {
        if self.is_imm(1) {
            // flags aside, the destination keeps its own taint
        } else if self.is_mem(1) {
            if let Some(dst) = self.gpr(0) {
                self.always(Propagation::BinaryM2R { dst, src: Binding::MemoryReadEa });
            }
        } else if self.is_mem(0) {
            if let Some(src) = self.gpr(1) {
                self.always(Propagation::BinaryR2M { dst: Binding::MemoryWriteEa, src });
            }
        } else if let Some((dst, src)) = self.gpr_pair() {
            if clears_itself && self.reg(0) == self.reg(1) {
                self.always(Propagation::ClearReg(dst));
            } else {
                self.always(Propagation::BinaryR2R { dst, src });
            }
        }
    }

    /// mov, bsf, bsr: t[dst] = t[src]
    fn mov(&mut self) {
        let untainted_source = self.is_imm(1) || self.reg(1).map_or(false, Register::is_seg);
        if untainted_source {
            if self.is_mem(0) {
                let width = self.exe.operand_width(self.ins, 0);
                self.always(Propagation::ClearMem(MemOperand::write(width)));
            } else if let Some(dst) = self.reg(0).and_then(Register::operand) {
                self.always(Propagation::ClearReg(dst));
            }
        } else if self.is_mem(1) {
            if let Some(dst) = self.reg(0).and_then(Register::operand) {
                self.always(Propagation::XferM2R { dst, src: Binding::MemoryReadEa });
            }
        } else if self.is_mem(0) {
            if let Some(src) = self.gpr(1) {
                self.always(Propagation::XferR2M { dst: Binding::MemoryWriteEa, src });
            }
        } else if self.reg(0).map_or(false, Register::is_seg) {
            // loads into segment registers carry no taint we track
        } else if let Some((dst, src)) = self.gpr_pair() {
            self.always(Propagation::XferR2R { dst, src });
        }
    }

    fn cmov(&mut self) {
        if self.is_mem(1) {
            if let Some(dst) = self.gpr(0) {
                self.predicated(Propagation::XferM2R { dst, src: Binding::MemoryReadEa });
            }
        } else if let Some((dst, src)) = self.gpr_pair() {
            self.predicated(Propagation::XferR2R { dst, src });
        }
    }

    /// movsx, movzx
    fn extend(&mut self) {
        let dst = match self.gpr(0) {
            Some(dst) => dst,
            None => return,
        };
        if self.is_mem(1) {
            let width = self.exe.operand_width(self.ins, 1);
            self.always(Propagation::Extend { dst, src: Either::Right(MemOperand::read(width)) });
        } else if let Some(src) = self.gpr(1) {
            if src.width() >= dst.width() {
                self.unhandled("extension does not widen");
                return;
            }
            self.always(Propagation::Extend { dst, src: Either::Left(src) });
        }
    }

    /// One-operand mul, div, idiv, imul
    fn ternary(&mut self) {
        if self.is_mem(0) {
            let width = self.exe.operand_width(self.ins, 0);
            self.always(Propagation::Ternary { src: Either::Right(MemOperand::read(width)) });
        } else if let Some(src) = self.gpr(0) {
            self.always(Propagation::Ternary { src: Either::Left(src) });
        }
    }

    fn imul(&mut self) {
        if self.exe.operand_count(self.ins) < 2 || self.exe.operand_is_implicit(self.ins, 1) {
            self.ternary();
        } else if self.is_imm(1) {
            // imul r, imm: the destination keeps its own taint
        } else if self.is_mem(1) {
            if let Some(dst) = self.gpr(0) {
                self.always(Propagation::BinaryM2R { dst, src: Binding::MemoryReadEa });
            }
        } else if let Some((dst, src)) = self.gpr_pair() {
            self.always(Propagation::BinaryR2R { dst, src });
        }
    }

    fn setcc(&mut self) {
        if self.is_mem(0) {
            self.predicated(Propagation::ClearMem(MemOperand::write(1)));
        } else if let Some(dst) = self.gpr(0) {
            self.predicated(Propagation::ClearReg(dst));
        }
    }

    /// smsw, str: register or 16-bit memory destination
    fn clear_operand(&mut self) {
        if self.is_mem(0) {
            self.always(Propagation::ClearMem(MemOperand::write(2)));
        } else {
            self.clear_register();
        }
    }

    fn clear_register(&mut self) {
        if let Some(dst) = self.gpr(0) {
            self.always(Propagation::ClearReg(dst));
        }
    }

    fn cmpxchg(&mut self) {
        if self.is_mem(0) {
            let src = match self.gpr(1) {
                Some(src) => src,
                None => return,
            };
            let width = src.width();
            self.attach(CallMode::If, Propagation::CmpxchgFastM2R {
                src: MemOperand::read(width),
                acc_value: Binding::RegValue(accumulator(width)),
                mem_value: Binding::MemoryValue { width },
            });
            self.attach(CallMode::Then, Propagation::CmpxchgSlowR2M { dst: Binding::MemoryWriteEa, src });
        } else if let Some((dst, src)) = self.gpr_pair() {
            let dst_reg = match self.reg(0) {
                Some(reg) => reg,
                None => return,
            };
            self.attach(CallMode::If, Propagation::CmpxchgFastR2R {
                dst,
                acc_value: Binding::RegValue(accumulator(dst.width())),
                dst_value: Binding::RegValue(dst_reg),
            });
            self.attach(CallMode::Then, Propagation::CmpxchgSlowR2R { dst, src });
        }
    }

    /// Swap the taint of two 32-bit registers through the scratch slot
    fn swap_through_scratch(&mut self, dst: RegOperand, src: RegOperand) {
        let scratch = RegOperand::new(Gpr::Scratch, View::Long);
        self.always(Propagation::XferR2R { dst: scratch, src: dst });
        self.always(Propagation::XferR2R { dst, src });
        self.always(Propagation::XferR2R { dst: src, src: scratch });
    }

    fn xchg(&mut self) {
        if self.is_mem(0) || self.is_mem(1) {
            let reg = if self.is_mem(0) { self.gpr(1) } else { self.gpr(0) };
            if let Some(reg) = reg {
                self.always(Propagation::XchgM2R { reg, mem: Binding::MemoryWriteEa });
            }
        } else if let Some((dst, src)) = self.gpr_pair() {
            if dst.view == View::Long {
                self.swap_through_scratch(dst, src);
            } else {
                self.always(Propagation::XchgR2R { dst, src });
            }
        }
    }

    fn xadd(&mut self) {
        if self.is_mem(0) {
            if let Some(src) = self.gpr(1) {
                self.always(Propagation::XaddR2M { dst: Binding::MemoryWriteEa, src });
            }
        } else if let Some((dst, src)) = self.gpr_pair() {
            if dst.view == View::Long {
                self.swap_through_scratch(dst, src);
                self.always(Propagation::BinaryR2R { dst, src });
            } else {
                self.always(Propagation::XaddR2R { dst, src });
            }
        }
    }

    fn lea(&mut self) {
        let dst = match self.gpr(0) {
            Some(dst) => dst,
            None => return,
        };
        // address registers are read through the destination's view
        let as_dst = |reg: Register| {
            reg.view().map(|_| RegOperand::new(reg.slot(), dst.view))
        };
        let base = self.exe.memory_base_reg(self.ins).and_then(as_dst);
        let index = self.exe.memory_index_reg(self.ins).and_then(as_dst);
        match (base, index) {
            (None, None) => self.always(Propagation::ClearReg(dst)),
            (Some(src), None) | (None, Some(src)) => {
                self.always(Propagation::XferR2R { dst, src })
            },
            (Some(_), Some(_)) => self.always(Propagation::Lea { dst, base, index }),
        }
    }

    fn lods(&mut self, dst: RegOperand) {
        self.predicated(Propagation::XferM2R { dst, src: Binding::MemoryReadEa });
    }

    fn stos(&mut self, src: RegOperand) {
        if self.exe.has_rep_prefix(self.ins) {
            let count = self.exe.rep_count_register(self.ins);
            self.attach(CallMode::IfPredicated, Propagation::RepPredicate {
                first: Binding::FirstRepIteration,
            });
            self.attach(CallMode::ThenPredicated, Propagation::XferR2MRep {
                dst: Binding::MemoryWriteEa,
                src,
                count: Binding::RegValue(count),
                eflags: Binding::RegValue(Register::Eflags),
            });
        } else {
            self.always(Propagation::XferR2M { dst: Binding::MemoryWriteEa, src });
        }
    }

    fn movs(&mut self, width: usize) {
        self.predicated(Propagation::XferM2M {
            dst: Binding::MemoryWriteEa,
            src: Binding::MemoryReadEa,
            width,
        });
    }

    fn pop(&mut self) {
        if self.is_mem(0) {
            let width = self.exe.operand_width(self.ins, 0);
            self.always(Propagation::XferM2M {
                dst: Binding::MemoryWriteEa,
                src: Binding::MemoryReadEa,
                width,
            });
        } else if self.reg(0).map_or(false, Register::is_seg) {
            // segment register loads are untracked
        } else if let Some(dst) = self.gpr(0) {
            self.always(Propagation::XferM2R { dst, src: Binding::MemoryReadEa });
        }
    }

    fn push(&mut self) {
        if self.is_mem(0) {
            let width = self.exe.operand_width(self.ins, 0);
            self.always(Propagation::XferM2M {
                dst: Binding::MemoryWriteEa,
                src: Binding::MemoryReadEa,
                width,
            });
        } else if self.is_imm(0) || self.reg(0).map_or(false, Register::is_seg) {
            let width = self.stack_width(self.exe.memory_size(self.ins));
            self.always(Propagation::ClearMem(MemOperand::write(width)));
        } else if let Some(src) = self.gpr(0) {
            self.always(Propagation::XferR2M { dst: Binding::MemoryWriteEa, src });
        }
    }

    /// leave: esp = ebp; pop ebp
    fn leave(&mut self) {
        let view = if self.exe.memory_size(self.ins) == 2 { View::Word } else { View::Long };
        let esp = RegOperand::new(Gpr::Esp, view);
        let ebp = RegOperand::new(Gpr::Ebp, view);
        self.always(Propagation::XferR2R { dst: esp, src: ebp });
        self.always(Propagation::XferM2R { dst: ebp, src: Binding::MemoryReadEa });
    }
}

/// The implicit accumulator of a `width`-byte `cmpxchg`
fn accumulator(width: usize) -> Register {
    match width {
        1 => Register::Al,
        2 => Register::Ax,
        _ => Register::Eax,
    }
}
