//! Gekko interpreter
//!
//! [`Semantics`] is the per-instruction contract the translation backends fall
//! back to for anything they do not emit natively. [`PpuInterpreter`] implements
//! it for the integer, branch, load/store and scalar floating-point subset and
//! additionally offers a reference [`PpuInterpreter::step`].

use og_memory::{AccessSize, MemoryBus};

use crate::access::{AccessPath, MemAccess};
use crate::analyzer::{InstructionFlags, PpuAnalyzer};
use crate::decoder::{InstructionForm, PpuDecoder};
use crate::exceptions::{ExceptionController, ExceptionKind};
use crate::state::{Msr, PpuState};

/// How control continues after an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fall through to the next sequential instruction
    Next,
    /// Continue at the given address
    Jump(u32),
    /// The instruction raised an exception and had no other effect
    Exception(ExceptionKind),
}

/// Per-instruction guest semantics
pub trait Semantics {
    /// Execute `opcode` located at `address`; `state.pc` equals `address` on entry
    fn execute(&self, state: &mut PpuState, memory: &mut MemoryBus, address: u32, opcode: u32) -> Step;
}

/// MSR bits restored by rfi
const RFI_MSR_MASK: u32 = 0x87C0_FF73;

/// Gekko interpreter
#[derive(Debug, Default, Clone, Copy)]
pub struct PpuInterpreter;

impl PpuInterpreter {
    pub fn new() -> Self {
        Self
    }

    /// Execute one instruction at `state.pc`, delivering any exception it raises.
    /// Returns the cycles charged.
    pub fn step(
        &self,
        state: &mut PpuState,
        memory: &mut MemoryBus,
        exceptions: &mut dyn ExceptionController,
    ) -> u32 {
        let pc = state.pc;
        let opcode = match memory.fetch(state.instruction_space(), pc) {
            Ok(opcode) => opcode,
            Err(_) => {
                exceptions.raise(state, ExceptionKind::Isi);
                exceptions.check_exceptions(state);
                return 0;
            }
        };
        let cycles = PpuAnalyzer::classify(pc, opcode).cycles;
        match self.execute(state, memory, pc, opcode) {
            Step::Next => state.pc = pc.wrapping_add(4),
            Step::Jump(target) => state.pc = target,
            Step::Exception(kind) => {
                state.pc = pc;
                exceptions.raise(state, kind);
                exceptions.check_exceptions(state);
            }
        }
        state.downcount -= cycles as i64;
        cycles
    }

    fn execute_d_form(&self, state: &mut PpuState, memory: &mut MemoryBus, address: u32, opcode: u32, op: u8) -> Step {
        let (rt, ra, d) = PpuDecoder::d_form(opcode);
        let rt = rt as usize;
        let ra = ra as usize;
        let simm = d as i32 as u32;
        let uimm = d as u16 as u32;

        match op {
            // twi
            3 => {
                if trap_condition(rt as u8, state.gpr[ra] as i32, simm as i32) {
                    return Step::Exception(ExceptionKind::Program);
                }
            }
            // mulli
            7 => state.gpr[rt] = (state.gpr[ra] as i32).wrapping_mul(simm as i32) as u32,
            // subfic
            8 => {
                let a = state.gpr[ra];
                state.gpr[rt] = simm.wrapping_sub(a);
                state.set_xer_ca(carry_add(!a, simm, 1));
            }
            // cmpli
            10 => {
                let ordering = state.gpr[ra].cmp(&uimm);
                compare(state, (rt >> 2) & 7, ordering);
            }
            // cmpi
            11 => {
                let ordering = (state.gpr[ra] as i32).cmp(&(simm as i32));
                compare(state, (rt >> 2) & 7, ordering);
            }
            // addic, addic.
            12 | 13 => {
                let a = state.gpr[ra];
                let result = a.wrapping_add(simm);
                state.gpr[rt] = result;
                state.set_xer_ca(result < a);
                if op == 13 {
                    update_cr0(state, result);
                }
            }
            // addi
            14 => state.gpr[rt] = if ra == 0 { simm } else { state.gpr[ra].wrapping_add(simm) },
            // addis
            15 => {
                let shifted = uimm << 16;
                state.gpr[rt] = if ra == 0 { shifted } else { state.gpr[ra].wrapping_add(shifted) };
            }
            // ori, oris, xori, xoris
            24 => state.gpr[ra] = state.gpr[rt] | uimm,
            25 => state.gpr[ra] = state.gpr[rt] | (uimm << 16),
            26 => state.gpr[ra] = state.gpr[rt] ^ uimm,
            27 => state.gpr[ra] = state.gpr[rt] ^ (uimm << 16),
            // andi., andis.
            28 | 29 => {
                let mask = if op == 28 { uimm } else { uimm << 16 };
                let result = state.gpr[rt] & mask;
                state.gpr[ra] = result;
                update_cr0(state, result);
            }
            // lmw
            46 => {
                let base = if ra == 0 { 0 } else { state.gpr[ra] };
                let ea = base.wrapping_add(simm);
                let space = state.data_space();
                let mut values = Vec::with_capacity(32 - rt);
                for i in 0..(32 - rt) as u32 {
                    let addr = ea.wrapping_add(i * 4);
                    match memory.read(space, addr, AccessSize::Word) {
                        Ok(v) => values.push(v as u32),
                        Err(_) => return Step::Exception(ExceptionKind::Dsi { addr, store: false }),
                    }
                }
                state.gpr[rt..].copy_from_slice(&values);
            }
            // stmw
            47 => {
                let base = if ra == 0 { 0 } else { state.gpr[ra] };
                let ea = base.wrapping_add(simm);
                let space = state.data_space();
                for (i, r) in (rt..32).enumerate() {
                    let addr = ea.wrapping_add(i as u32 * 4);
                    if memory.write(space, addr, AccessSize::Word, state.gpr[r] as u64).is_err() {
                        return Step::Exception(ExceptionKind::Dsi { addr, store: true });
                    }
                }
            }
            32..=45 | 48..=55 => return self.execute_access(state, memory, opcode),
            _ => {
                tracing::warn!("Unimplemented D-form op {} at 0x{:08x}", op, address);
                return Step::Exception(ExceptionKind::Program);
            }
        }
        Step::Next
    }

    fn execute_access(&self, state: &mut PpuState, memory: &mut MemoryBus, opcode: u32) -> Step {
        let Some(access) = MemAccess::from_opcode(opcode) else {
            return Step::Exception(ExceptionKind::Program);
        };
        if access.is_float() && !state.msr.contains(Msr::FP) {
            return Step::Exception(ExceptionKind::FpUnavailable);
        }
        match access.perform(state, memory, AccessPath::Slow) {
            Ok(()) => Step::Next,
            Err(_) => Step::Exception(ExceptionKind::Dsi {
                addr: access.effective_address(state),
                store: access.store,
            }),
        }
    }

    /// Execute I-form instructions (branches)
    fn execute_i_form(&self, state: &mut PpuState, address: u32, opcode: u32) -> Step {
        let (li, aa, lk) = PpuDecoder::i_form(opcode);
        if lk {
            state.lr = address.wrapping_add(4);
        }
        let target = if aa { li as u32 } else { address.wrapping_add(li as u32) };
        Step::Jump(target)
    }

    /// Execute B-form instructions (conditional branches)
    fn execute_b_form(&self, state: &mut PpuState, address: u32, opcode: u32) -> Step {
        let (bo, bi, bd, aa, lk) = PpuDecoder::b_form(opcode);
        let ctr_ok = decrement_ctr(state, bo);
        let cond_ok = condition_ok(state, bo, bi);
        if lk {
            state.lr = address.wrapping_add(4);
        }
        if ctr_ok && cond_ok {
            let target = if aa {
                bd as i32 as u32
            } else {
                address.wrapping_add(bd as i32 as u32)
            };
            Step::Jump(target)
        } else {
            Step::Next
        }
    }

    /// Execute XL-form instructions (branch to LR/CTR, CR logic, rfi)
    fn execute_xl_form(&self, state: &mut PpuState, address: u32, opcode: u32, xo: u16) -> Step {
        let (bt, ba, bb, _, _) = PpuDecoder::x_form(opcode);
        let lk = (opcode & 1) != 0;

        match xo {
            // bclr
            16 => {
                let ctr_ok = decrement_ctr(state, bt);
                let cond_ok = condition_ok(state, bt, ba);
                let target = state.lr & !3;
                if lk {
                    state.lr = address.wrapping_add(4);
                }
                if ctr_ok && cond_ok {
                    return Step::Jump(target);
                }
            }
            // bcctr
            528 => {
                let cond_ok = condition_ok(state, bt, ba);
                let target = state.ctr & !3;
                if lk {
                    state.lr = address.wrapping_add(4);
                }
                if cond_ok {
                    return Step::Jump(target);
                }
            }
            // mcrf
            0 => {
                let value = state.cr_field((ba >> 2) as usize);
                state.set_cr_field((bt >> 2) as usize, value);
            }
            // rfi
            50 => {
                if state.msr.contains(Msr::PR) {
                    return Step::Exception(ExceptionKind::Program);
                }
                let msr = (state.msr.bits() & !RFI_MSR_MASK) | (state.srr1 & RFI_MSR_MASK);
                state.msr = Msr::from_bits_retain(msr & !Msr::POW.bits());
                return Step::Jump(state.srr0 & !3);
            }
            // isync
            150 => {}
            // CR logical operations
            33 | 129 | 193 | 225 | 257 | 289 | 417 | 449 => {
                let a = state.cr_bit(ba as u32);
                let b = state.cr_bit(bb as u32);
                let result = match xo {
                    33 => !(a | b),
                    129 => a & !b,
                    193 => a ^ b,
                    225 => !(a & b),
                    257 => a & b,
                    289 => !(a ^ b),
                    417 => a | !b,
                    _ => a | b,
                };
                state.set_cr_bit(bt as u32, result);
            }
            _ => {
                tracing::warn!("Unimplemented XL-form xo {} at 0x{:08x}", xo, address);
                return Step::Exception(ExceptionKind::Program);
            }
        }
        Step::Next
    }

    /// Execute primary opcode 31 (X and XO forms)
    fn execute_x_form(&self, state: &mut PpuState, memory: &mut MemoryBus, address: u32, opcode: u32, xo: u16) -> Step {
        let (rt, ra, rb, _, rc) = PpuDecoder::x_form(opcode);
        let oe = ((opcode >> 10) & 1) != 0;
        let (rt, ra, rb) = (rt as usize, ra as usize, rb as usize);
        let a = state.gpr[ra];
        let b = state.gpr[rb];
        let s = state.gpr[rt];

        // Integer arithmetic writes rD; logical operations write rA
        let mut arith: Option<(u32, Option<bool>)> = None;
        let mut logical: Option<u32> = None;

        match xo {
            // cmp, cmpl
            0 => compare(state, (rt >> 2) & 7, (a as i32).cmp(&(b as i32))),
            32 => compare(state, (rt >> 2) & 7, a.cmp(&b)),
            // tw
            4 => {
                if trap_condition(rt as u8, a as i32, b as i32) {
                    return Step::Exception(ExceptionKind::Program);
                }
            }
            // subfc
            8 => {
                let r = b.wrapping_sub(a);
                state.set_xer_ca(carry_add(!a, b, 1));
                arith = Some((r, Some(sub_overflow(b, a, r))));
            }
            // addc
            10 => {
                let r = a.wrapping_add(b);
                state.set_xer_ca(r < a);
                arith = Some((r, Some(add_overflow(a, b, r))));
            }
            // mulhwu
            11 => arith = Some((((a as u64 * b as u64) >> 32) as u32, None)),
            // subf
            40 => {
                let r = b.wrapping_sub(a);
                arith = Some((r, Some(sub_overflow(b, a, r))));
            }
            // mulhw
            75 => arith = Some(((((a as i32 as i64) * (b as i32 as i64)) >> 32) as u32, None)),
            // neg
            104 => arith = Some(((a as i32).wrapping_neg() as u32, Some(a == 0x8000_0000))),
            // subfe
            136 => {
                let ca = state.xer_ca() as u32;
                let r = (!a).wrapping_add(b).wrapping_add(ca);
                state.set_xer_ca(carry_add(!a, b, ca));
                arith = Some((r, Some(add_overflow(!a, b, r))));
            }
            // adde
            138 => {
                let ca = state.xer_ca() as u32;
                let r = a.wrapping_add(b).wrapping_add(ca);
                state.set_xer_ca(carry_add(a, b, ca));
                arith = Some((r, Some(add_overflow(a, b, r))));
            }
            // subfze
            200 => {
                let ca = state.xer_ca() as u32;
                let r = (!a).wrapping_add(ca);
                state.set_xer_ca(carry_add(!a, 0, ca));
                arith = Some((r, Some(add_overflow(!a, 0, r))));
            }
            // addze
            202 => {
                let ca = state.xer_ca() as u32;
                let r = a.wrapping_add(ca);
                state.set_xer_ca(carry_add(a, 0, ca));
                arith = Some((r, Some(add_overflow(a, 0, r))));
            }
            // subfme
            232 => {
                let ca = state.xer_ca() as u32;
                let r = (!a).wrapping_add(u32::MAX).wrapping_add(ca);
                state.set_xer_ca(carry_add(!a, u32::MAX, ca));
                arith = Some((r, Some(add_overflow(!a, u32::MAX, r))));
            }
            // addme
            234 => {
                let ca = state.xer_ca() as u32;
                let r = a.wrapping_add(u32::MAX).wrapping_add(ca);
                state.set_xer_ca(carry_add(a, u32::MAX, ca));
                arith = Some((r, Some(add_overflow(a, u32::MAX, r))));
            }
            // mullw
            235 => {
                let wide = (a as i32 as i64) * (b as i32 as i64);
                arith = Some((wide as u32, Some(wide != wide as i32 as i64)));
            }
            // add
            266 => {
                let r = a.wrapping_add(b);
                arith = Some((r, Some(add_overflow(a, b, r))));
            }
            // divwu
            459 => {
                if b == 0 {
                    arith = Some((0, Some(true)));
                } else {
                    arith = Some((a / b, Some(false)));
                }
            }
            // divw
            491 => {
                let (sa, sb) = (a as i32, b as i32);
                if sb == 0 {
                    arith = Some((if sa < 0 { u32::MAX } else { 0 }, Some(true)));
                } else if sa == i32::MIN && sb == -1 {
                    arith = Some((u32::MAX, Some(true)));
                } else {
                    arith = Some(((sa / sb) as u32, Some(false)));
                }
            }
            // mfcr
            19 => state.gpr[rt] = state.cr,
            // cntlzw
            26 => logical = Some(s.leading_zeros()),
            // slw
            24 => logical = Some(if b & 0x20 != 0 { 0 } else { s << (b & 0x1F) }),
            // and, andc
            28 => logical = Some(s & b),
            60 => logical = Some(s & !b),
            // mfmsr
            83 => {
                if state.msr.contains(Msr::PR) {
                    return Step::Exception(ExceptionKind::Program);
                }
                state.gpr[rt] = state.msr.bits();
            }
            // nor
            124 => logical = Some(!(s | b)),
            // mtcrf
            144 => {
                let crm = (opcode >> 12) & 0xFF;
                let mut mask = 0u32;
                for field in 0..8 {
                    if crm & (0x80 >> field) != 0 {
                        mask |= 0xF000_0000 >> (field * 4);
                    }
                }
                state.cr = (state.cr & !mask) | (s & mask);
            }
            // mtmsr
            146 => {
                if state.msr.contains(Msr::PR) {
                    return Step::Exception(ExceptionKind::Program);
                }
                state.msr = Msr::from_bits_retain(s);
            }
            // eqv, xor
            284 => logical = Some(!(s ^ b)),
            316 => logical = Some(s ^ b),
            // mfspr
            339 => state.gpr[rt] = state.mfspr(PpuDecoder::spr_field(opcode)),
            // orc, or
            412 => logical = Some(s | !b),
            444 => logical = Some(s | b),
            // mtspr
            467 => state.mtspr(PpuDecoder::spr_field(opcode), s),
            // nand
            476 => logical = Some(!(s & b)),
            // srw
            536 => logical = Some(if b & 0x20 != 0 { 0 } else { s >> (b & 0x1F) }),
            // sraw, srawi
            792 | 824 => {
                let n = if xo == 824 { rb as u32 } else { b & 0x3F };
                let negative = (s as i32) < 0;
                let (result, lost) = if n >= 32 {
                    (if negative { u32::MAX } else { 0 }, s != 0)
                } else {
                    (((s as i32) >> n) as u32, n > 0 && s & ((1u32 << n) - 1) != 0)
                };
                state.set_xer_ca(negative && lost);
                logical = Some(result);
            }
            // extsh, extsb
            922 => logical = Some(s as u16 as i16 as i32 as u32),
            954 => logical = Some(s as u8 as i8 as i32 as u32),
            // dcbz
            1014 => {
                let base = if ra == 0 { 0 } else { a };
                let ea = base.wrapping_add(b) & !31;
                let space = state.data_space();
                for i in 0..4 {
                    let addr = ea + i * 8;
                    if memory.write(space, addr, AccessSize::Double, 0).is_err() {
                        return Step::Exception(ExceptionKind::Dsi { addr: ea, store: true });
                    }
                }
            }
            // dcbst, dcbf, dcbtst, dcbt, dcbi, sync, eieio, icbi
            54 | 86 | 246 | 278 | 470 | 598 | 854 | 982 => {}
            _ => {
                if MemAccess::from_opcode(opcode).is_some() {
                    return self.execute_access(state, memory, opcode);
                }
                tracing::warn!("Unimplemented X-form xo {} at 0x{:08x}", xo, address);
                return Step::Exception(ExceptionKind::Program);
            }
        }

        if let Some((result, overflow)) = arith {
            state.gpr[rt] = result;
            if oe {
                if let Some(overflow) = overflow {
                    state.set_xer_ov(overflow);
                }
            }
            if rc {
                update_cr0(state, result);
            }
        }
        if let Some(result) = logical {
            state.gpr[ra] = result;
            if rc {
                update_cr0(state, result);
            }
        }
        Step::Next
    }

    /// Execute M-form instructions (rotate)
    fn execute_m_form(&self, state: &mut PpuState, opcode: u32, op: u8) -> Step {
        let (rs, ra, rb_sh, mb, me, rc) = PpuDecoder::m_form(opcode);
        let value = state.gpr[rs as usize];
        let mask = Self::generate_mask_32(mb, me);

        let result = match op {
            // rlwimi
            20 => (value.rotate_left(rb_sh as u32) & mask) | (state.gpr[ra as usize] & !mask),
            // rlwinm
            21 => value.rotate_left(rb_sh as u32) & mask,
            // rlwnm
            _ => value.rotate_left(state.gpr[rb_sh as usize] & 0x1F) & mask,
        };
        state.gpr[ra as usize] = result;
        if rc {
            update_cr0(state, result);
        }
        Step::Next
    }

    /// Execute scalar floating-point instructions (primary opcodes 59 and 63)
    fn execute_float(&self, state: &mut PpuState, address: u32, opcode: u32, op: u8, xo: u16) -> Step {
        if !state.msr.contains(Msr::FP) {
            return Step::Exception(ExceptionKind::FpUnavailable);
        }
        let (frt, fra, frb, frc, _) = PpuDecoder::a_form(opcode);
        let a = state.fpr[fra as usize];
        let b = state.fpr[frb as usize];
        let c = state.fpr[frc as usize];
        let single = op == 59;

        let result = match (op, xo) {
            (_, 18) => a / b,
            (_, 20) => a - b,
            (_, 21) => a + b,
            (_, 25) => a * c,
            (_, 28) => a.mul_add(c, -b),
            (_, 29) => a.mul_add(c, b),
            (_, 30) => -a.mul_add(c, -b),
            (_, 31) => -a.mul_add(c, b),
            (63, 23) => {
                if a >= 0.0 {
                    c
                } else {
                    b
                }
            }
            // fcmpu
            (63, 0) => {
                let bf = (frt >> 2) as usize;
                let field = if a.is_nan() || b.is_nan() {
                    0b0001
                } else if a < b {
                    0b1000
                } else if a > b {
                    0b0100
                } else {
                    0b0010
                };
                state.set_cr_field(bf, field);
                return Step::Next;
            }
            // frsp
            (63, 12) => b as f32 as f64,
            // fctiw, fctiwz
            (63, 14) | (63, 15) => {
                let rounded = if xo == 15 { b.trunc() } else { b.round_ties_even() };
                let int = if b.is_nan() { i32::MIN } else { rounded as i32 };
                f64::from_bits(0xFFF8_0000_0000_0000 | int as u32 as u64)
            }
            (63, 40) => -b,
            (63, 72) => b,
            (63, 136) => -b.abs(),
            (63, 264) => b.abs(),
            _ => {
                tracing::warn!("Unimplemented FP op {}/{} at 0x{:08x}", op, xo, address);
                return Step::Exception(ExceptionKind::Program);
            }
        };
        state.fpr[frt as usize] = if single { result as f32 as f64 } else { result };
        Step::Next
    }

    /// Execute system call
    fn execute_sc(&self, state: &PpuState, address: u32) -> Step {
        og_core::ppu_trace!("System call r0={} at 0x{:08x}", state.gpr[0], address);
        Step::Exception(ExceptionKind::Syscall)
    }

    /// Generate 32-bit mask for rotate instructions
    pub fn generate_mask_32(mb: u8, me: u8) -> u32 {
        let mb = mb as u32;
        let me = me as u32;
        if mb <= me {
            (u32::MAX >> mb) & (u32::MAX << (31 - me))
        } else {
            (u32::MAX >> mb) | (u32::MAX << (31 - me))
        }
    }
}

impl Semantics for PpuInterpreter {
    fn execute(&self, state: &mut PpuState, memory: &mut MemoryBus, address: u32, opcode: u32) -> Step {
        let decoded = PpuDecoder::decode(opcode);
        let flags = PpuAnalyzer::classify(address, opcode).flags;
        if flags.contains(InstructionFlags::USES_FPU) && !state.msr.contains(Msr::FP) {
            return Step::Exception(ExceptionKind::FpUnavailable);
        }

        match decoded.form {
            InstructionForm::D => self.execute_d_form(state, memory, address, opcode, decoded.op),
            InstructionForm::I => self.execute_i_form(state, address, opcode),
            InstructionForm::B => self.execute_b_form(state, address, opcode),
            InstructionForm::SC => self.execute_sc(state, address),
            InstructionForm::XL => self.execute_xl_form(state, address, opcode, decoded.xo),
            InstructionForm::X => self.execute_x_form(state, memory, address, opcode, decoded.xo),
            InstructionForm::M => self.execute_m_form(state, opcode, decoded.op),
            InstructionForm::A => self.execute_float(state, address, opcode, decoded.op, decoded.xo),
            InstructionForm::PS | InstructionForm::Unknown => {
                tracing::warn!("Unimplemented instruction 0x{:08x} at 0x{:08x}", opcode, address);
                Step::Exception(ExceptionKind::Program)
            }
        }
    }
}

/// Update CR0 based on a result (Rc=1 instructions)
fn update_cr0(state: &mut PpuState, value: u32) {
    compare(state, 0, (value as i32).cmp(&0));
}

fn compare(state: &mut PpuState, field: usize, ordering: std::cmp::Ordering) {
    let c = match ordering {
        std::cmp::Ordering::Less => 0b1000,
        std::cmp::Ordering::Greater => 0b0100,
        std::cmp::Ordering::Equal => 0b0010,
    };
    let c = c | state.xer_so() as u32;
    state.set_cr_field(field, c);
}

fn decrement_ctr(state: &mut PpuState, bo: u8) -> bool {
    if bo & 0x04 != 0 {
        return true;
    }
    state.ctr = state.ctr.wrapping_sub(1);
    (state.ctr != 0) ^ (bo & 0x02 != 0)
}

fn condition_ok(state: &PpuState, bo: u8, bi: u8) -> bool {
    bo & 0x10 != 0 || state.cr_bit(bi as u32) == (bo & 0x08 != 0)
}

fn carry_add(a: u32, b: u32, carry_in: u32) -> bool {
    (a as u64 + b as u64 + carry_in as u64) >> 32 != 0
}

fn add_overflow(a: u32, b: u32, r: u32) -> bool {
    ((a ^ r) & (b ^ r)) & 0x8000_0000 != 0
}

fn sub_overflow(b: u32, a: u32, r: u32) -> bool {
    ((b ^ a) & (b ^ r)) & 0x8000_0000 != 0
}

fn trap_condition(to: u8, a: i32, b: i32) -> bool {
    (to & 0x10 != 0 && a < b)
        || (to & 0x08 != 0 && a > b)
        || (to & 0x04 != 0 && a == b)
        || (to & 0x02 != 0 && (a as u32) < (b as u32))
        || (to & 0x01 != 0 && (a as u32) > (b as u32))
}
