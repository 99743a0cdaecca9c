//! Load/store access descriptors
//!
//! A [`MemAccess`] captures everything needed to perform a single guest load or
//! store outside the instruction decoder: where the address comes from, how wide
//! the access is, and how the value moves between memory and the register file.
//! The interpreter, the recompiler's native memory operations and the slow-path
//! trampolines all perform accesses through [`MemAccess::perform`], so every path
//! produces the same guest-visible result.

use og_core::error::MemoryError;
use og_memory::{AccessSize, MemoryBus};

use crate::decoder::PpuDecoder;
use crate::state::PpuState;

/// Register that supplies or receives the accessed value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTarget {
    Gpr(u8),
    /// FPR moved as raw 64-bit double
    FprDouble(u8),
    /// FPR converted to/from a 32-bit single
    FprSingle(u8),
}

/// Second address operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOffset {
    Imm(i16),
    Reg(u8),
}

/// Which accessor family performs the access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPath {
    /// Direct arena indexing; faults on anything but present RAM
    Fast,
    /// Translated access with MMIO and permission handling
    Slow,
}

/// A single guest load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub store: bool,
    pub size: AccessSize,
    pub sign_extend: bool,
    pub byte_reverse: bool,
    /// Base register; `None` when rA is 0 and reads as literal zero
    pub base: Option<u8>,
    pub offset: AccessOffset,
    pub target: AccessTarget,
    /// Write the effective address back into the base register
    pub update: bool,
}

impl MemAccess {
    /// Describe the access performed by `opcode`, if it is a single load or store
    pub fn from_opcode(opcode: u32) -> Option<MemAccess> {
        let op = opcode >> 26;
        let (rt, ra, d) = PpuDecoder::d_form(opcode);
        let base = if ra == 0 { None } else { Some(ra) };

        let d_form = |store: bool, size: AccessSize, sign_extend: bool, target: AccessTarget, update: bool| {
            Some(MemAccess {
                store,
                size,
                sign_extend,
                byte_reverse: false,
                base,
                offset: AccessOffset::Imm(d),
                target,
                update,
            })
        };

        use AccessSize::*;
        use AccessTarget::*;
        match op {
            32 => d_form(false, Word, false, Gpr(rt), false),
            33 => d_form(false, Word, false, Gpr(rt), true),
            34 => d_form(false, Byte, false, Gpr(rt), false),
            35 => d_form(false, Byte, false, Gpr(rt), true),
            36 => d_form(true, Word, false, Gpr(rt), false),
            37 => d_form(true, Word, false, Gpr(rt), true),
            38 => d_form(true, Byte, false, Gpr(rt), false),
            39 => d_form(true, Byte, false, Gpr(rt), true),
            40 => d_form(false, Half, false, Gpr(rt), false),
            41 => d_form(false, Half, false, Gpr(rt), true),
            42 => d_form(false, Half, true, Gpr(rt), false),
            43 => d_form(false, Half, true, Gpr(rt), true),
            44 => d_form(true, Half, false, Gpr(rt), false),
            45 => d_form(true, Half, false, Gpr(rt), true),
            48 => d_form(false, Word, false, FprSingle(rt), false),
            49 => d_form(false, Word, false, FprSingle(rt), true),
            50 => d_form(false, Double, false, FprDouble(rt), false),
            51 => d_form(false, Double, false, FprDouble(rt), true),
            52 => d_form(true, Word, false, FprSingle(rt), false),
            53 => d_form(true, Word, false, FprSingle(rt), true),
            54 => d_form(true, Double, false, FprDouble(rt), false),
            55 => d_form(true, Double, false, FprDouble(rt), true),
            31 => Self::from_indexed(opcode),
            _ => None,
        }
    }

    fn from_indexed(opcode: u32) -> Option<MemAccess> {
        let (rt, ra, rb, xo, _) = PpuDecoder::x_form(opcode);
        use AccessSize::*;
        use AccessTarget::*;
        // (store, size, sign_extend, byte_reverse, target, update)
        let (store, size, sign_extend, byte_reverse, target, update) = match xo {
            23 => (false, Word, false, false, Gpr(rt), false),
            55 => (false, Word, false, false, Gpr(rt), true),
            87 => (false, Byte, false, false, Gpr(rt), false),
            119 => (false, Byte, false, false, Gpr(rt), true),
            151 => (true, Word, false, false, Gpr(rt), false),
            183 => (true, Word, false, false, Gpr(rt), true),
            215 => (true, Byte, false, false, Gpr(rt), false),
            247 => (true, Byte, false, false, Gpr(rt), true),
            279 => (false, Half, false, false, Gpr(rt), false),
            311 => (false, Half, false, false, Gpr(rt), true),
            343 => (false, Half, true, false, Gpr(rt), false),
            375 => (false, Half, true, false, Gpr(rt), true),
            407 => (true, Half, false, false, Gpr(rt), false),
            439 => (true, Half, false, false, Gpr(rt), true),
            534 => (false, Word, false, true, Gpr(rt), false),
            662 => (true, Word, false, true, Gpr(rt), false),
            790 => (false, Half, false, true, Gpr(rt), false),
            918 => (true, Half, false, true, Gpr(rt), false),
            535 => (false, Word, false, false, FprSingle(rt), false),
            567 => (false, Word, false, false, FprSingle(rt), true),
            599 => (false, Double, false, false, FprDouble(rt), false),
            631 => (false, Double, false, false, FprDouble(rt), true),
            663 => (true, Word, false, false, FprSingle(rt), false),
            695 => (true, Word, false, false, FprSingle(rt), true),
            727 => (true, Double, false, false, FprDouble(rt), false),
            759 => (true, Double, false, false, FprDouble(rt), true),
            _ => return None,
        };
        Some(MemAccess {
            store,
            size,
            sign_extend,
            byte_reverse,
            base: if ra == 0 { None } else { Some(ra) },
            offset: AccessOffset::Reg(rb),
            target,
            update,
        })
    }

    /// Whether the access moves a floating-point register
    pub fn is_float(&self) -> bool {
        !matches!(self.target, AccessTarget::Gpr(_))
    }

    /// Effective address for the current register values
    #[inline]
    pub fn effective_address(&self, state: &PpuState) -> u32 {
        let base = self.base.map_or(0, |r| state.gpr[r as usize]);
        match self.offset {
            AccessOffset::Imm(d) => base.wrapping_add(d as i32 as u32),
            AccessOffset::Reg(r) => base.wrapping_add(state.gpr[r as usize]),
        }
    }

    /// Raw memory value a store writes
    pub fn store_value(&self, state: &PpuState) -> u64 {
        let raw = match self.target {
            AccessTarget::Gpr(r) => state.gpr[r as usize] as u64 & self.size.mask(),
            AccessTarget::FprDouble(r) => state.fpr[r as usize].to_bits(),
            AccessTarget::FprSingle(r) => (state.fpr[r as usize] as f32).to_bits() as u64,
        };
        if self.byte_reverse {
            reverse_bytes(raw, self.size)
        } else {
            raw
        }
    }

    /// Write a loaded raw memory value into the target register
    pub fn complete_load(&self, state: &mut PpuState, raw: u64) {
        let raw = if self.byte_reverse {
            reverse_bytes(raw, self.size)
        } else {
            raw
        };
        match self.target {
            AccessTarget::Gpr(r) => {
                let value = if self.sign_extend {
                    match self.size {
                        AccessSize::Byte => raw as u8 as i8 as i32 as u32,
                        AccessSize::Half => raw as u16 as i16 as i32 as u32,
                        _ => raw as u32,
                    }
                } else {
                    raw as u32
                };
                state.gpr[r as usize] = value;
            }
            AccessTarget::FprDouble(r) => state.fpr[r as usize] = f64::from_bits(raw),
            AccessTarget::FprSingle(r) => state.fpr[r as usize] = f32::from_bits(raw as u32) as f64,
        }
    }

    /// Perform the access; registers change only if memory accepted it
    pub fn perform(
        &self,
        state: &mut PpuState,
        memory: &mut MemoryBus,
        path: AccessPath,
    ) -> Result<(), MemoryError> {
        let ea = self.effective_address(state);
        let space = state.data_space();
        if self.store {
            let value = self.store_value(state);
            match path {
                AccessPath::Fast => memory.write_fast(space, ea, self.size, value)?,
                AccessPath::Slow => memory.write(space, ea, self.size, value)?,
            }
        } else {
            let raw = match path {
                AccessPath::Fast => memory.read_fast(space, ea, self.size)?,
                AccessPath::Slow => memory.read(space, ea, self.size)?,
            };
            self.complete_load(state, raw);
        }
        if self.update {
            if let Some(r) = self.base {
                state.gpr[r as usize] = ea;
            }
        }
        Ok(())
    }
}

fn reverse_bytes(value: u64, size: AccessSize) -> u64 {
    match size {
        AccessSize::Byte => value,
        AccessSize::Half => (value as u16).swap_bytes() as u64,
        AccessSize::Word => (value as u32).swap_bytes() as u64,
        AccessSize::Double => value.swap_bytes(),
    }
}
