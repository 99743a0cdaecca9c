//! Host code format
//!
//! Translated blocks are sequences of host ops written into the code regions.
//! Every op is a one-byte tag followed by a packed little-endian payload. Ops
//! are position dependent in the same ways machine code is: jumps and link
//! slots hold absolute host addresses, and patching a memory access replaces
//! its bytes in place with a [`Jump`](HostOp::Jump) followed by trap filler.

use std::mem::size_of;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use og_memory::AccessSize;
use og_ppu::{AccessOffset, AccessTarget, MemAccess};

use crate::code_region::{HostAddr, TRAP_FILL};

/// Op tags
pub mod tag {
    pub const NOP: u8 = 0x90;
    pub const TRAP: u8 = super::TRAP_FILL;
    pub const CHECK_BREAKPOINT: u8 = 0x01;
    pub const CHECK_FPU: u8 = 0x02;
    pub const INTERPRET: u8 = 0x03;
    pub const MEM_FAST: u8 = 0x04;
    pub const MEM_SLOW: u8 = 0x05;
    pub const SAVE_REGS: u8 = 0x06;
    pub const RESTORE_REGS: u8 = 0x07;
    pub const EXIT: u8 = 0x08;
    pub const CHECK_WATCH: u8 = 0x09;
    pub const JUMP: u8 = 0xE9;
}

/// Link slot value meaning "not linked, return to the dispatcher"
pub const UNLINKED: HostAddr = u32::MAX;

/// Guard payload shared by breakpoint and FPU checks
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GuardArgs {
    pub pc: u32,
    /// Cycles charged if the guard exits the block
    pub cycles: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InterpretArgs {
    pub pc: u32,
    pub opcode: u32,
    /// Cycles of the block up to and including this instruction
    pub cycles: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u8 {
        const STORE        = 1 << 0;
        const SIGN_EXTEND  = 1 << 1;
        const BYTE_REVERSE = 1 << 2;
        const UPDATE       = 1 << 3;
        const HAS_BASE     = 1 << 4;
        const INDEXED      = 1 << 5;
    }
}

const TARGET_GPR: u8 = 0;
const TARGET_FPR_DOUBLE: u8 = 1;
const TARGET_FPR_SINGLE: u8 = 2;

/// Encoded load/store
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MemArgs {
    pub pc: u32,
    pub cycles: u32,
    pub target_kind: u8,
    pub target_reg: u8,
    pub base: u8,
    pub index: u8,
    pub size: u8,
    pub flags: u8,
    pub disp: i16,
}

impl MemArgs {
    pub fn new(access: &MemAccess, pc: u32, cycles: u32) -> Self {
        let mut flags = MemFlags::empty();
        flags.set(MemFlags::STORE, access.store);
        flags.set(MemFlags::SIGN_EXTEND, access.sign_extend);
        flags.set(MemFlags::BYTE_REVERSE, access.byte_reverse);
        flags.set(MemFlags::UPDATE, access.update);
        flags.set(MemFlags::HAS_BASE, access.base.is_some());
        let (index, disp) = match access.offset {
            AccessOffset::Imm(d) => (0, d),
            AccessOffset::Reg(r) => {
                flags |= MemFlags::INDEXED;
                (r, 0)
            }
        };
        let (target_kind, target_reg) = match access.target {
            AccessTarget::Gpr(r) => (TARGET_GPR, r),
            AccessTarget::FprDouble(r) => (TARGET_FPR_DOUBLE, r),
            AccessTarget::FprSingle(r) => (TARGET_FPR_SINGLE, r),
        };
        Self {
            pc,
            cycles,
            target_kind,
            target_reg,
            base: access.base.unwrap_or(0),
            index,
            size: access.size.bytes() as u8,
            flags: flags.bits(),
            disp,
        }
    }

    pub fn flags(&self) -> MemFlags {
        MemFlags::from_bits_truncate(self.flags)
    }

    /// Rebuild the access descriptor
    pub fn access(&self) -> Option<MemAccess> {
        let flags = self.flags();
        let size = AccessSize::from_bytes(self.size as u32)?;
        let target = match self.target_kind {
            TARGET_GPR => AccessTarget::Gpr(self.target_reg),
            TARGET_FPR_DOUBLE => AccessTarget::FprDouble(self.target_reg),
            TARGET_FPR_SINGLE => AccessTarget::FprSingle(self.target_reg),
            _ => return None,
        };
        let offset = if flags.contains(MemFlags::INDEXED) {
            AccessOffset::Reg(self.index)
        } else {
            AccessOffset::Imm(self.disp)
        };
        Some(MemAccess {
            store: flags.contains(MemFlags::STORE),
            size,
            sign_extend: flags.contains(MemFlags::SIGN_EXTEND),
            byte_reverse: flags.contains(MemFlags::BYTE_REVERSE),
            base: flags.contains(MemFlags::HAS_BASE).then_some(self.base),
            offset,
            target,
            update: flags.contains(MemFlags::UPDATE),
        })
    }

    /// Guest registers the access reads or writes: GPRs in the low word, FPRs in the high word
    pub fn live_regs(&self) -> u64 {
        let flags = self.flags();
        let mut mask = 0u64;
        if flags.contains(MemFlags::HAS_BASE) {
            mask |= 1 << self.base;
        }
        if flags.contains(MemFlags::INDEXED) {
            mask |= 1 << self.index;
        }
        match self.target_kind {
            TARGET_GPR => mask |= 1 << self.target_reg,
            _ => mask |= 1 << (32 + self.target_reg as u64),
        }
        mask
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ExitArgs {
    pub fallthrough: u32,
    /// Cycles of the whole block
    pub cycles: u32,
    /// Mode key the block was translated under
    pub mode: u8,
    pub slot_count: u8,
}

/// Rewritable link to a successor block
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LinkSlot {
    pub target: u32,
    pub entry: HostAddr,
}

/// Byte offset of [`LinkSlot::entry`] inside a slot
pub const LINK_ENTRY_OFFSET: u32 = 4;

/// Decoded host op
#[derive(Debug, Clone, Copy)]
pub enum HostOp {
    Nop,
    Trap,
    CheckBreakpoint(GuardArgs),
    CheckFpu(GuardArgs),
    /// Watchpoint check in front of an access; `cycles` counts up to the access
    CheckWatch(MemArgs),
    Interpret(InterpretArgs),
    MemFast(MemArgs),
    MemSlow(MemArgs),
    SaveRegs(u64),
    RestoreRegs(u64),
    Jump(HostAddr),
    /// Block exit; `slot_count` link slots follow the payload
    Exit(ExitArgs),
}

/// Encoded sizes
pub mod size {
    use super::*;

    pub const GUARD: usize = 1 + size_of::<GuardArgs>();
    pub const INTERPRET: usize = 1 + size_of::<InterpretArgs>();
    pub const MEM: usize = 1 + size_of::<MemArgs>();
    pub const REGS: usize = 1 + size_of::<u64>();
    pub const JUMP: usize = 1 + size_of::<u32>();
    pub const EXIT: usize = 1 + size_of::<ExitArgs>();
    pub const LINK_SLOT: usize = size_of::<LinkSlot>();
}

/// Malformed host code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError {
    pub tag: u8,
}

fn payload<T: Pod>(bytes: &[u8]) -> Result<T, DecodeError> {
    let len = size_of::<T>();
    match bytes.get(1..1 + len) {
        Some(raw) => Ok(bytemuck::pod_read_unaligned(raw)),
        None => Err(DecodeError { tag: bytes.first().copied().unwrap_or(0) }),
    }
}

/// Decode the op at the start of `bytes`, returning it with its encoded length
pub fn decode(bytes: &[u8]) -> Result<(HostOp, usize), DecodeError> {
    let tag = *bytes.first().ok_or(DecodeError { tag: 0 })?;
    let decoded = match tag {
        tag::NOP => (HostOp::Nop, 1),
        tag::TRAP => (HostOp::Trap, 1),
        tag::CHECK_BREAKPOINT => (HostOp::CheckBreakpoint(payload(bytes)?), size::GUARD),
        tag::CHECK_FPU => (HostOp::CheckFpu(payload(bytes)?), size::GUARD),
        tag::CHECK_WATCH => (HostOp::CheckWatch(payload(bytes)?), size::MEM),
        tag::INTERPRET => (HostOp::Interpret(payload(bytes)?), size::INTERPRET),
        tag::MEM_FAST => (HostOp::MemFast(payload(bytes)?), size::MEM),
        tag::MEM_SLOW => (HostOp::MemSlow(payload(bytes)?), size::MEM),
        tag::SAVE_REGS => (HostOp::SaveRegs(payload(bytes)?), size::REGS),
        tag::RESTORE_REGS => (HostOp::RestoreRegs(payload(bytes)?), size::REGS),
        tag::JUMP => (HostOp::Jump(payload(bytes)?), size::JUMP),
        tag::EXIT => {
            let args: ExitArgs = payload(bytes)?;
            let len = size::EXIT + args.slot_count as usize * size::LINK_SLOT;
            if bytes.len() < len {
                return Err(DecodeError { tag });
            }
            (HostOp::Exit(args), len)
        }
        _ => return Err(DecodeError { tag }),
    };
    Ok(decoded)
}

/// Link slots following an exit op at the start of `bytes`
pub fn link_slots(bytes: &[u8], args: &ExitArgs) -> Vec<LinkSlot> {
    (0..args.slot_count as usize)
        .filter_map(|i| {
            let start = size::EXIT + i * size::LINK_SLOT;
            bytes
                .get(start..start + size::LINK_SLOT)
                .map(bytemuck::pod_read_unaligned)
        })
        .collect()
}

/// Writes host ops into a bounded buffer
///
/// Overflowing the capacity does not panic; the emitter stops writing and
/// [`Emitter::has_write_failed`] reports it after the fact.
#[derive(Debug)]
pub struct Emitter {
    base: HostAddr,
    capacity: usize,
    buf: Vec<u8>,
    write_failed: bool,
}

impl Emitter {
    pub fn new(base: HostAddr, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            buf: Vec::new(),
            write_failed: false,
        }
    }

    /// Host address of the next byte
    pub fn position(&self) -> HostAddr {
        self.base + self.buf.len() as u32
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn has_write_failed(&self) -> bool {
        self.write_failed
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn put(&mut self, tag: u8, payload: &[u8]) {
        if self.write_failed || self.buf.len() + 1 + payload.len() > self.capacity {
            self.write_failed = true;
            return;
        }
        self.buf.push(tag);
        self.buf.extend_from_slice(payload);
    }

    /// Emit an arbitrary tagged record
    pub fn raw(&mut self, tag: u8, payload: &[u8]) {
        self.put(tag, payload);
    }

    pub fn nop(&mut self) {
        self.put(tag::NOP, &[]);
    }

    /// Pad with trap filler up to `len` total bytes
    pub fn trap_fill_to(&mut self, len: usize) {
        while self.buf.len() < len && !self.write_failed {
            self.put(tag::TRAP, &[]);
        }
    }

    pub fn check_breakpoint(&mut self, pc: u32, cycles_before: u32) {
        let args = GuardArgs { pc, cycles: cycles_before };
        self.put(tag::CHECK_BREAKPOINT, bytemuck::bytes_of(&args));
    }

    pub fn check_fpu(&mut self, pc: u32, cycles: u32) {
        let args = GuardArgs { pc, cycles };
        self.put(tag::CHECK_FPU, bytemuck::bytes_of(&args));
    }

    pub fn check_watch(&mut self, args: &MemArgs) {
        self.put(tag::CHECK_WATCH, bytemuck::bytes_of(args));
    }

    pub fn interpret(&mut self, pc: u32, opcode: u32, cycles: u32) {
        let args = InterpretArgs { pc, opcode, cycles };
        self.put(tag::INTERPRET, bytemuck::bytes_of(&args));
    }

    pub fn mem_fast(&mut self, args: &MemArgs) {
        self.put(tag::MEM_FAST, bytemuck::bytes_of(args));
    }

    pub fn mem_slow(&mut self, args: &MemArgs) {
        self.put(tag::MEM_SLOW, bytemuck::bytes_of(args));
    }

    pub fn save_regs(&mut self, mask: u64) {
        self.put(tag::SAVE_REGS, bytemuck::bytes_of(&mask));
    }

    pub fn restore_regs(&mut self, mask: u64) {
        self.put(tag::RESTORE_REGS, bytemuck::bytes_of(&mask));
    }

    pub fn jump(&mut self, target: HostAddr) {
        self.put(tag::JUMP, bytemuck::bytes_of(&target));
    }

    /// Emit an exit with one unlinked slot per target; returns the slot addresses
    pub fn exit(&mut self, fallthrough: u32, cycles: u32, mode: u8, targets: &[u32]) -> Vec<HostAddr> {
        let args = ExitArgs {
            fallthrough,
            cycles,
            mode,
            slot_count: targets.len() as u8,
        };
        let mut payload = bytemuck::bytes_of(&args).to_vec();
        let slots_start = self.position() + size::EXIT as u32;
        let mut slots = Vec::with_capacity(targets.len());
        for (i, &target) in targets.iter().enumerate() {
            let slot = LinkSlot { target, entry: UNLINKED };
            payload.extend_from_slice(bytemuck::bytes_of(&slot));
            slots.push(slots_start + (i * size::LINK_SLOT) as u32);
        }
        self.put(tag::EXIT, &payload);
        slots
    }
}

/// Human-readable listing of host code starting at `base`
pub fn disassemble(bytes: &[u8], base: HostAddr) -> Vec<String> {
    let mut lines = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let addr = base + offset as u32;
        let (op, len) = match decode(&bytes[offset..]) {
            Ok(decoded) => decoded,
            Err(e) => {
                lines.push(format!("{:08x}: .byte 0x{:02x}", addr, e.tag));
                offset += 1;
                continue;
            }
        };
        let text = match op {
            HostOp::Nop => "nop".to_string(),
            HostOp::Trap => "trap".to_string(),
            HostOp::CheckBreakpoint(g) => format!("check_breakpoint pc={:08x}", { g.pc }),
            HostOp::CheckFpu(g) => format!("check_fpu pc={:08x}", { g.pc }),
            HostOp::CheckWatch(m) => format!("check_watch pc={:08x} {}", { m.pc }, describe_mem(&m)),
            HostOp::Interpret(a) => format!("interpret pc={:08x} op={:08x}", { a.pc }, { a.opcode }),
            HostOp::MemFast(m) => format!("mem.fast pc={:08x} {}", { m.pc }, describe_mem(&m)),
            HostOp::MemSlow(m) => format!("mem.slow pc={:08x} {}", { m.pc }, describe_mem(&m)),
            HostOp::SaveRegs(mask) => format!("save_regs {:016x}", mask),
            HostOp::RestoreRegs(mask) => format!("restore_regs {:016x}", mask),
            HostOp::Jump(target) => format!("jmp {:08x}", target),
            HostOp::Exit(x) => {
                let slots = link_slots(&bytes[offset..], &x)
                    .iter()
                    .map(|s| match { s.entry } {
                        UNLINKED => format!("{:08x}->dispatch", { s.target }),
                        entry => format!("{:08x}->{:08x}", { s.target }, entry),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("exit next={:08x} cycles={} [{}]", { x.fallthrough }, { x.cycles }, slots)
            }
        };
        lines.push(format!("{:08x}: {}", addr, text));
        offset += len;
    }
    lines
}

fn describe_mem(m: &MemArgs) -> String {
    let flags = m.flags();
    let dir = if flags.contains(MemFlags::STORE) { "st" } else { "ld" };
    let reg = match m.target_kind {
        TARGET_GPR => format!("r{}", m.target_reg),
        _ => format!("f{}", m.target_reg),
    };
    if flags.contains(MemFlags::INDEXED) {
        format!("{}{} {}, r{}, r{}", dir, m.size, reg, m.base, m.index)
    } else {
        format!("{}{} {}, {}(r{})", dir, m.size, reg, { m.disp }, m.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patchable_access_fits_jump() {
        assert!(size::MEM >= size::JUMP);
        assert_eq!(size::MEM, 17);
        assert_eq!(size::JUMP, 5);
    }

    #[test]
    fn test_emit_and_decode_sequence() {
        let mut emitter = Emitter::new(0x100, 256);
        emitter.interpret(0x8000_0000, 0x3860_0001, 1);
        let slots = emitter.exit(0x8000_0004, 1, 0, &[0x8000_0004]);
        assert_eq!(slots, vec![0x100 + size::INTERPRET as u32 + size::EXIT as u32]);

        let bytes = emitter.into_bytes();
        let (op, len) = decode(&bytes).unwrap();
        assert_eq!(len, size::INTERPRET);
        match op {
            HostOp::Interpret(a) => assert_eq!({ a.opcode }, 0x3860_0001),
            other => panic!("unexpected {:?}", other),
        }
        let (op, len) = decode(&bytes[size::INTERPRET..]).unwrap();
        assert_eq!(len, size::EXIT + size::LINK_SLOT);
        let HostOp::Exit(args) = op else { panic!("expected exit") };
        let slots = link_slots(&bytes[size::INTERPRET..], &args);
        assert_eq!({ slots[0].entry }, UNLINKED);
    }

    #[test]
    fn test_overflow_sets_write_failed() {
        let mut emitter = Emitter::new(0, 8);
        emitter.interpret(0, 0, 1);
        assert!(emitter.has_write_failed());
        assert!(emitter.is_empty());
    }

    #[test]
    fn test_mem_args_rebuild_access() {
        // lhzu r5, -2(r6)
        let access = MemAccess::from_opcode(0xA4A6_FFFE).unwrap();
        let args = MemArgs::new(&access, 0x8000_1000, 3);
        assert_eq!(args.access(), Some(access));
        assert_eq!(args.live_regs(), (1 << 5) | (1 << 6));
    }

    #[test]
    fn test_disassemble_marks_unlinked_slots() {
        let mut emitter = Emitter::new(0, 256);
        emitter.jump(0x40);
        emitter.exit(0x10, 2, 0, &[0x20]);
        let listing = disassemble(emitter.bytes(), 0);
        assert_eq!(listing[0], "00000000: jmp 00000040");
        assert!(listing[1].contains("00000020->dispatch"));
    }

    #[test]
    fn test_unknown_tag_is_error() {
        assert_eq!(decode(&[0x77]).unwrap_err(), DecodeError { tag: 0x77 });
        assert!(decode(&[tag::JUMP, 1]).is_err());
    }
}
