//! The propagation library: one function per data-movement or merge rule,
//! per operand shape.
//!
//! Everything here works on taint only. Real operand values are consulted in
//! exactly two places: the outcome of `cmpxchg`, and the direction flag of
//! `rep stos`.

use crate::tagmap::{width_mask, Direction, TagMap};
use crate::vcpu::{Gpr, RegOperand, Vcpu, View, VCPU_MASK16, VCPU_MASK32, VCPU_MASK8};

/// Expands the lower-byte taint bit (indexed by `word & 1`) over a 16-bit view
pub const MAP_8L_16: [u32; 2] = [0, VCPU_MASK16];
/// Expands the upper-byte taint bit (indexed by `word & 2`) over a 16-bit view
pub const MAP_8H_16: [u32; 3] = [0, 0, VCPU_MASK16];
/// Expands the lower-byte taint bit (indexed by `word & 1`) over a 32-bit view
pub const MAP_8L_32: [u32; 2] = [0, VCPU_MASK32];
/// Expands the upper-byte taint bit (indexed by `word & 2`) over a 32-bit view
pub const MAP_8H_32: [u32; 3] = [0, 0, VCPU_MASK32];

const EAX: RegOperand = RegOperand { slot: Gpr::Eax, view: View::Long };

/// The accumulator view matching an operand of the given view
fn accumulator(view: View) -> RegOperand {
    match view {
        View::Long => EAX,
        View::Word => RegOperand::new(Gpr::Eax, View::Word),
        View::Lower8 | View::Upper8 => RegOperand::new(Gpr::Eax, View::Lower8),
    }
}

// ---- transfer: t[dst] = t[src] ----

pub fn r2r_xfer(vcpu: &mut Vcpu, dst: RegOperand, src: RegOperand) {
    debug_assert_eq!(dst.width(), src.width());
    let bits = vcpu.get(src);
    vcpu.set(dst, bits);
}

pub fn m2r_xfer<T: TagMap + ?Sized>(vcpu: &mut Vcpu, tags: &T, dst: RegOperand, src: u32) {
    vcpu.set(dst, tags.get(src, dst.width()));
}

pub fn r2m_xfer<T: TagMap + ?Sized>(tags: &mut T, vcpu: &Vcpu, dst: u32, src: RegOperand) {
    tags.set_bits(dst, src.width(), vcpu.get(src));
}

pub fn m2m_xfer<T: TagMap + ?Sized>(tags: &mut T, dst: u32, src: u32, width: usize) {
    let bits = tags.get(src, width);
    tags.set_bits(dst, width, bits);
}

/// `rep stos`: store the taint of `src` over `count` consecutive elements.
///
/// Byte `i` of the range gets the taint of byte `i % width` of `src`, which
/// is what `count` single stores would produce. `dst` is the address of the
/// first element stored; with EFLAGS.DF set the following elements go
/// below it, so the range ends at the last byte of that first element.
pub fn r2m_xfer_n<T: TagMap + ?Sized>(
    tags: &mut T,
    vcpu: &Vcpu,
    dst: u32,
    src: RegOperand,
    count: u32,
    eflags: u32,
) {
    let unit = src.width() as u32;
    let total = count.wrapping_mul(unit);
    if total == 0 {
        return;
    }
    let dir = Direction::from_eflags(eflags);
    let anchor = match dir {
        Direction::Ascending => dst,
        Direction::Descending => dst.wrapping_add(unit - 1),
    };
    let bits = vcpu.get(src);
    if bits == 0 {
        tags.clear_range(anchor, total, dir);
    } else if bits == width_mask(src.width()) {
        tags.set_range(anchor, total, dir);
    } else {
        let start = dir.start(anchor, total);
        for i in 0..total {
            tags.set_bits(start.wrapping_add(i), 1, (bits >> (i % unit)) & 1);
        }
    }
}

// ---- binary merge: t[dst] |= t[src] ----

pub fn r2r_binary(vcpu: &mut Vcpu, dst: RegOperand, src: RegOperand) {
    debug_assert_eq!(dst.width(), src.width());
    let bits = vcpu.get(src);
    vcpu.merge(dst, bits);
}

pub fn m2r_binary<T: TagMap + ?Sized>(vcpu: &mut Vcpu, tags: &T, dst: RegOperand, src: u32) {
    vcpu.merge(dst, tags.get(src, dst.width()));
}

pub fn r2m_binary<T: TagMap + ?Sized>(tags: &mut T, vcpu: &Vcpu, dst: u32, src: RegOperand) {
    tags.merge(dst, src.width(), vcpu.get(src));
}

// ---- ternary merge: one explicit source, implicit (E)DX:(E)AX destination ----

/// `mul`/`div` with a register source. 8-bit forms write AX only.
pub fn r2r_ternary(vcpu: &mut Vcpu, src: RegOperand) {
    let word = vcpu.word(src.slot);
    match src.view {
        View::Lower8 => {
            let eax = vcpu.word(Gpr::Eax);
            vcpu.set_word(Gpr::Eax, eax | MAP_8L_16[(word & VCPU_MASK8) as usize]);
        },
        View::Upper8 => {
            let eax = vcpu.word(Gpr::Eax);
            vcpu.set_word(Gpr::Eax, eax | MAP_8H_16[(word & (VCPU_MASK8 << 1)) as usize]);
        },
        View::Word | View::Long => {
            let bits = vcpu.get(src);
            let view = src.view;
            vcpu.merge(RegOperand::new(Gpr::Edx, view), bits);
            vcpu.merge(RegOperand::new(Gpr::Eax, view), bits);
        },
    }
}

/// `mul`/`div` with a memory source of `width` bytes
pub fn m2r_ternary<T: TagMap + ?Sized>(vcpu: &mut Vcpu, tags: &T, src: u32, width: usize) {
    let bits = tags.get(src, width);
    match width {
        1 => {
            let eax = vcpu.word(Gpr::Eax);
            vcpu.set_word(Gpr::Eax, eax | MAP_8L_16[bits as usize]);
        },
        _ => {
            let view = if width == 2 { View::Word } else { View::Long };
            vcpu.merge(RegOperand::new(Gpr::Edx, view), bits);
            vcpu.merge(RegOperand::new(Gpr::Eax, view), bits);
        },
    }
}

// ---- sign/zero extension ----

/// Widen right-aligned taint `bits` of a `from`-byte source to `to` bytes.
/// The new high bytes inherit the taint of the source.
fn widen(bits: u32, from: usize, to: usize) -> u32 {
    match (from, to) {
        (1, 2) => MAP_8L_16[(bits & VCPU_MASK8) as usize],
        (1, 4) => MAP_8L_32[(bits & VCPU_MASK8) as usize],
        (2, 4) => {
            let low = bits & VCPU_MASK16;
            low | (low << 2)
        },
        _ => bits,
    }
}

/// `movsx`/`movzx` between registers
pub fn r2r_extend(vcpu: &mut Vcpu, dst: RegOperand, src: RegOperand) {
    let word = vcpu.word(src.slot);
    let bits = match (src.view, dst.view) {
        (View::Lower8, View::Word) => MAP_8L_16[(word & VCPU_MASK8) as usize],
        (View::Upper8, View::Word) => MAP_8H_16[(word & (VCPU_MASK8 << 1)) as usize],
        (View::Lower8, View::Long) => MAP_8L_32[(word & VCPU_MASK8) as usize],
        (View::Upper8, View::Long) => MAP_8H_32[(word & (VCPU_MASK8 << 1)) as usize],
        _ => widen(vcpu.get(src), src.width(), dst.width()),
    };
    vcpu.set(dst, bits);
}

/// `movsx`/`movzx` from a `width`-byte memory source
pub fn m2r_extend<T: TagMap + ?Sized>(
    vcpu: &mut Vcpu,
    tags: &T,
    dst: RegOperand,
    src: u32,
    width: usize,
) {
    let bits = widen(tags.get(src, width), width, dst.width());
    vcpu.set(dst, bits);
}

/// `cwde`: EAX takes AX's taint, replicated into the upper half
pub fn cwde(vcpu: &mut Vcpu) {
    let ax = vcpu.word(Gpr::Eax) & VCPU_MASK16;
    vcpu.set_word(Gpr::Eax, ax | (ax << 2));
}

// ---- exchange ----

pub fn r2r_xchg(vcpu: &mut Vcpu, dst: RegOperand, src: RegOperand) {
    debug_assert_eq!(dst.width(), src.width());
    let d = vcpu.get(dst);
    let s = vcpu.get(src);
    vcpu.set(dst, s);
    vcpu.set(src, d);
}

pub fn m2r_xchg<T: TagMap + ?Sized>(vcpu: &mut Vcpu, tags: &mut T, reg: RegOperand, mem: u32) {
    let width = reg.width();
    let r = vcpu.get(reg);
    let m = tags.get(mem, width);
    vcpu.set(reg, m);
    tags.set_bits(mem, width, r);
}

// ---- exchange-and-add: exchange, then t[dst] |= t[src] ----

pub fn r2r_xadd(vcpu: &mut Vcpu, dst: RegOperand, src: RegOperand) {
    r2r_xchg(vcpu, dst, src);
    r2r_binary(vcpu, dst, src);
}

pub fn r2m_xadd<T: TagMap + ?Sized>(vcpu: &mut Vcpu, tags: &mut T, dst: u32, src: RegOperand) {
    m2r_xchg(vcpu, tags, src, dst);
    r2m_binary(tags, vcpu, dst, src);
}

// ---- compare-and-exchange ----
//
// The fast path always runs: it parks the accumulator's taint in the scratch
// slot and assumes the "not equal" outcome, where the accumulator is loaded
// from the destination. It returns whether the values were equal, in which
// case the slow path undoes that and moves the source into the destination.

pub fn r2r_cmpxchg_fast(vcpu: &mut Vcpu, dst: RegOperand, acc_value: u32, dst_value: u32) -> bool {
    let acc = accumulator(dst.view);
    let saved = vcpu.word(Gpr::Eax);
    vcpu.set_word(Gpr::Scratch, saved);
    let bits = vcpu.get(dst);
    vcpu.set(acc, bits);
    let mask = value_mask(dst.width());
    acc_value & mask == dst_value & mask
}

pub fn r2r_cmpxchg_slow(vcpu: &mut Vcpu, dst: RegOperand, src: RegOperand) {
    restore_accumulator(vcpu, dst.view);
    r2r_xfer(vcpu, dst, src);
}

pub fn m2r_cmpxchg_fast<T: TagMap + ?Sized>(
    vcpu: &mut Vcpu,
    tags: &T,
    src: u32,
    width: usize,
    acc_value: u32,
    mem_value: u32,
) -> bool {
    let acc = accumulator(view_for_width(width));
    let saved = vcpu.word(Gpr::Eax);
    vcpu.set_word(Gpr::Scratch, saved);
    vcpu.set(acc, tags.get(src, width));
    let mask = value_mask(width);
    acc_value & mask == mem_value & mask
}

pub fn r2m_cmpxchg_slow<T: TagMap + ?Sized>(vcpu: &mut Vcpu, tags: &mut T, dst: u32, src: RegOperand) {
    restore_accumulator(vcpu, src.view);
    r2m_xfer(tags, vcpu, dst, src);
}

fn restore_accumulator(vcpu: &mut Vcpu, view: View) {
    let acc = accumulator(view);
    let saved = vcpu.word(Gpr::Scratch);
    vcpu.set(acc, (saved & acc.view.mask()) >> acc.view.shift());
}

fn value_mask(width: usize) -> u32 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

fn view_for_width(width: usize) -> View {
    match width {
        1 => View::Lower8,
        2 => View::Word,
        _ => View::Long,
    }
}

// ---- address computation ----

/// `lea`: the destination depends on whichever of base and index are present
pub fn lea(vcpu: &mut Vcpu, dst: RegOperand, base: Option<RegOperand>, index: Option<RegOperand>) {
    let bits = base.map_or(0, |b| vcpu.get(b)) | index.map_or(0, |i| vcpu.get(i));
    vcpu.set(dst, bits);
}

// ---- bulk register save/restore ----

/// `pusha`/`pushad`: every slot, EDI first, at `dst + i * width`
pub fn save_all<T: TagMap + ?Sized>(tags: &mut T, vcpu: &Vcpu, dst: u32, width: usize) {
    let view = view_for_width(width);
    for (i, &slot) in Gpr::ALL.iter().enumerate() {
        let addr = dst.wrapping_add((i * width) as u32);
        tags.set_bits(addr, width, vcpu.get(RegOperand::new(slot, view)));
    }
}

/// `popa`/`popad`: the inverse of `save_all`, except that the stack pointer
/// is not restored from memory
pub fn restore_all<T: TagMap + ?Sized>(vcpu: &mut Vcpu, tags: &T, src: u32, width: usize) {
    let view = view_for_width(width);
    for (i, &slot) in Gpr::ALL.iter().enumerate() {
        if slot == Gpr::Esp {
            continue;
        }
        let addr = src.wrapping_add((i * width) as u32);
        vcpu.set(RegOperand::new(slot, view), tags.get(addr, width));
    }
}

/// Gate for `rep`-prefixed bulk stores: true only on the first iteration
pub fn rep_predicate(first_iteration: bool) -> bool {
    first_iteration
}
