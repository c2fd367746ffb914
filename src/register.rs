use crate::vcpu::{Gpr, RegOperand, View};

/// An x86-32 register, as named by the engine.
///
/// Hosts translate their own register numbering into this type; anything the
/// engine does not track goes into `Other`, carrying the host's identifier
/// for diagnostics.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Register {
    Eax, Ecx, Edx, Ebx, Esp, Ebp, Esi, Edi,
    Ax, Cx, Dx, Bx, Sp, Bp, Si, Di,
    Al, Cl, Dl, Bl,
    Ah, Ch, Dh, Bh,
    Es, Cs, Ss, Ds, Fs, Gs,
    Eflags,
    Other(u32),
}

impl Register {
    pub fn is_gr32(self) -> bool {
        use Register::*;
        matches!(self, Eax | Ecx | Edx | Ebx | Esp | Ebp | Esi | Edi)
    }

    pub fn is_gr16(self) -> bool {
        use Register::*;
        matches!(self, Ax | Cx | Dx | Bx | Sp | Bp | Si | Di)
    }

    pub fn is_gr8(self) -> bool {
        self.is_lower8() || self.is_upper8()
    }

    pub fn is_upper8(self) -> bool {
        use Register::*;
        matches!(self, Ah | Ch | Dh | Bh)
    }

    pub fn is_lower8(self) -> bool {
        use Register::*;
        matches!(self, Al | Cl | Dl | Bl)
    }

    pub fn is_seg(self) -> bool {
        use Register::*;
        matches!(self, Es | Cs | Ss | Ds | Fs | Gs)
    }

    /// Tag-file slot holding this register's taint.
    ///
    /// Registers without a slot of their own map to `Gpr::Scratch`, so that
    /// a stray write can never corrupt an architectural register's taint.
    pub fn slot(self) -> Gpr {
        use Register::*;
        match self {
            Edi | Di => Gpr::Edi,
            Esi | Si => Gpr::Esi,
            Ebp | Bp => Gpr::Ebp,
            Esp | Sp => Gpr::Esp,
            Ebx | Bx | Bl | Bh => Gpr::Ebx,
            Edx | Dx | Dl | Dh => Gpr::Edx,
            Ecx | Cx | Cl | Ch => Gpr::Ecx,
            Eax | Ax | Al | Ah => Gpr::Eax,
            _ => Gpr::Scratch,
        }
    }

    /// Which part of its slot this register covers, if it is a GPR at all
    pub fn view(self) -> Option<View> {
        if self.is_gr32() {
            Some(View::Long)
        } else if self.is_gr16() {
            Some(View::Word)
        } else if self.is_upper8() {
            Some(View::Upper8)
        } else if self.is_lower8() {
            Some(View::Lower8)
        } else {
            None
        }
    }

    /// The register as a tag-file operand, if it is a GPR
    pub fn operand(self) -> Option<RegOperand> {
        self.view().map(|view| RegOperand::new(self.slot(), view))
    }
}
