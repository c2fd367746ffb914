use crate::error::{Error, Result};
use log::info;
use std::convert::TryFrom;

/// Mask selecting the taint bits of a `width`-byte window (1, 2 or 4 bytes).
pub fn width_mask(width: usize) -> u32 {
    debug_assert!(width == 1 || width == 2 || width == 4, "bad width {}", width);
    (1 << width) - 1
}

/// Whether a ranged update grows upwards from `addr`, or downwards with
/// `addr` being the last byte of the range (string instructions with
/// EFLAGS.DF set).
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    /// The lowest address of a `count`-byte range anchored at `addr`
    pub fn start(self, addr: u32, count: u32) -> u32 {
        match self {
            Direction::Ascending => addr,
            Direction::Descending => addr.wrapping_sub(count).wrapping_add(1),
        }
    }

    /// Decode the direction flag (bit 10) of an EFLAGS value
    pub fn from_eflags(eflags: u32) -> Self {
        if eflags & (1 << 10) == 0 {
            Direction::Ascending
        } else {
            Direction::Descending
        }
    }
}

/// Shadow memory: one taint bit per byte of the monitored address space.
///
/// Values going in and out are always right-aligned: bit 0 of the value
/// corresponds to the byte at `addr`, bit 1 to `addr + 1`, and so on.
///
/// Callers guarantee that addresses are inside the covered range; the host
/// engine validates them before any analysis code runs.
pub trait TagMap {
    /// Taint bits of the `width` bytes starting at `addr`
    fn get(&self, addr: u32, width: usize) -> u32;

    /// Overwrite the taint bits of the `width` bytes starting at `addr` with
    /// `value`. Bits of neighbouring bytes are left untouched.
    fn set_bits(&mut self, addr: u32, width: usize, value: u32);

    fn clear(&mut self, addr: u32, width: usize) {
        self.set_bits(addr, width, 0)
    }

    fn set_all(&mut self, addr: u32, width: usize) {
        self.set_bits(addr, width, width_mask(width))
    }

    /// OR `value` into the taint bits of the `width` bytes starting at `addr`
    fn merge(&mut self, addr: u32, width: usize, value: u32) {
        let current = self.get(addr, width);
        self.set_bits(addr, width, current | value)
    }

    /// Is any byte of the `len` bytes starting at `addr` tainted
    fn is_tainted(&self, addr: u32, len: u32) -> bool {
        (0..len).any(|i| self.get(addr.wrapping_add(i), 1) != 0)
    }

    /// Taint `count` consecutive bytes
    fn set_range(&mut self, addr: u32, count: u32, dir: Direction) {
        let start = dir.start(addr, count);
        for i in 0..count {
            self.set_all(start.wrapping_add(i), 1);
        }
    }

    /// Untaint `count` consecutive bytes
    fn clear_range(&mut self, addr: u32, count: u32, dir: Direction) {
        let start = dir.start(addr, count);
        for i in 0..count {
            self.clear(start.wrapping_add(i), 1);
        }
    }
}

/// The default `TagMap`: a flat bit array with bit `addr % 8` of byte
/// `addr / 8` holding the taint of `addr`.
pub struct Bitmap {
    /// One trailing guard byte so that a 16-bit window starting at the last
    /// byte never runs off the end
    bits: Vec<u8>,
    /// Number of bytes of address space covered
    covered: u64,
}

impl Bitmap {
    /// Allocate a zeroed bitmap covering `address_space` bytes
    pub fn new(address_space: u64) -> Result<Self> {
        if address_space == 0 || address_space > (1 << 32) {
            return Err(Error::InvalidAddressSpace(address_space));
        }
        let len = usize::try_from((address_space + 7) / 8 + 1)
            .map_err(|_| Error::InvalidAddressSpace(address_space))?;
        let mut bits = Vec::new();
        bits.try_reserve_exact(len)
            .map_err(|_| Error::ShadowAlloc { bytes: len })?;
        bits.resize(len, 0);
        info!("Allocated {} bytes of shadow memory for {:#x} bytes of address space", len, address_space);
        Ok(Self {
            bits,
            covered: address_space,
        })
    }

    /// Number of bytes of address space this bitmap covers
    pub fn address_space(&self) -> u64 {
        self.covered
    }

    /// Size of the bitmap itself, in bytes
    pub fn shadow_size(&self) -> usize {
        self.bits.len()
    }

    fn window(&self, index: usize) -> u16 {
        u16::from_le_bytes([self.bits[index], self.bits[index + 1]])
    }

    fn set_window(&mut self, index: usize, window: u16) {
        let [lo, hi] = window.to_le_bytes();
        self.bits[index] = lo;
        self.bits[index + 1] = hi;
    }

    fn fill(&mut self, start: u32, count: u32, byte: u8) {
        let mut addr = u64::from(start);
        let end = addr + u64::from(count);
        debug_assert!(end <= self.covered, "range {:#x}+{} out of bounds", start, count);
        // unaligned head and tail go bit by bit, the aligned middle byte by byte
        while addr < end && addr % 8 != 0 {
            self.set_bits(addr as u32, 1, u32::from(byte & 1));
            addr += 1;
        }
        let whole = (end - addr) / 8;
        if whole > 0 {
            let first = (addr / 8) as usize;
            for b in &mut self.bits[first..first + whole as usize] {
                *b = byte;
            }
            addr += whole * 8;
        }
        while addr < end {
            self.set_bits(addr as u32, 1, u32::from(byte & 1));
            addr += 1;
        }
    }
}

impl TagMap for Bitmap {
    fn get(&self, addr: u32, width: usize) -> u32 {
        debug_assert!(u64::from(addr) < self.covered, "address {:#x} out of bounds", addr);
        let window = self.window((addr >> 3) as usize);
        (u32::from(window) >> (addr & 7)) & width_mask(width)
    }

    fn set_bits(&mut self, addr: u32, width: usize, value: u32) {
        debug_assert!(u64::from(addr) < self.covered, "address {:#x} out of bounds", addr);
        let index = (addr >> 3) as usize;
        let offset = addr & 7;
        let mask = (width_mask(width) << offset) as u16;
        let bits = (((value & width_mask(width)) << offset) as u16) & mask;
        let window = (self.window(index) & !mask) | bits;
        self.set_window(index, window);
    }

    fn set_range(&mut self, addr: u32, count: u32, dir: Direction) {
        let start = dir.start(addr, count);
        self.fill(start, count, 0xff);
    }

    fn clear_range(&mut self, addr: u32, count: u32, dir: Direction) {
        let start = dir.start(addr, count);
        self.fill(start, count, 0);
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        info!("Released {} bytes of shadow memory for {:#x} bytes of address space", self.bits.len(), self.covered);
    }
}
