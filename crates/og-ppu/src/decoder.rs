//! Gekko instruction decoder

/// Decoded instruction
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstruction {
    /// Raw opcode
    pub opcode: u32,
    /// Primary opcode (bits 0-5)
    pub op: u8,
    /// Extended opcode (various positions depending on instruction form)
    pub xo: u16,
    /// Instruction form
    pub form: InstructionForm,
}

/// Instruction forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionForm {
    /// I-Form: Branch instructions
    I,
    /// B-Form: Conditional branch
    B,
    /// SC-Form: System call
    SC,
    /// D-Form: Load/store with displacement, immediates
    D,
    /// X-Form: Indexed load/store, integer arithmetic, misc (primary opcode 31)
    X,
    /// XL-Form: Branch conditional to LR/CTR, CR logic
    XL,
    /// M-Form: Rotate and mask
    M,
    /// A-Form: Floating-point arithmetic (primary opcodes 59 and 63)
    A,
    /// PS-Form: Paired singles (primary opcode 4)
    PS,
    /// Unknown form
    Unknown,
}

/// XO-form extended opcodes of primary opcode 31 (OE bit masked off)
const XO_FORM_OPS: [u16; 16] = [
    8, 10, 11, 40, 75, 104, 136, 138, 200, 202, 232, 234, 235, 266, 459, 491,
];

/// Gekko instruction decoder
pub struct PpuDecoder;

impl PpuDecoder {
    /// Decode a 32-bit instruction
    pub fn decode(opcode: u32) -> DecodedInstruction {
        let op = ((opcode >> 26) & 0x3F) as u8;

        let (form, xo) = match op {
            18 => (InstructionForm::I, 0),
            16 => (InstructionForm::B, 0),
            17 => (InstructionForm::SC, 0),

            2 | 3 | // tdi, twi
            7 | // mulli
            8 | // subfic
            10..=15 | // cmpli, cmpi, addic, addic., addi, addis
            24..=29 | // ori, oris, xori, xoris, andi., andis.
            32..=47 | // integer loads/stores, lmw, stmw
            48..=55 => (InstructionForm::D, 0), // floating-point loads/stores

            19 => (InstructionForm::XL, ((opcode >> 1) & 0x3FF) as u16),
            31 => (InstructionForm::X, Self::extended_31(opcode)),
            20 | 21 | 23 => (InstructionForm::M, 0),
            59 | 63 => {
                let a_xo = ((opcode >> 1) & 0x1F) as u16;
                // Opcode 63 mixes A-form (xo >= 16 in the 5-bit field) with X-form
                if op == 63 && a_xo < 16 {
                    (InstructionForm::A, ((opcode >> 1) & 0x3FF) as u16)
                } else {
                    (InstructionForm::A, a_xo)
                }
            }
            4 => (InstructionForm::PS, ((opcode >> 1) & 0x3FF) as u16),
            _ => (InstructionForm::Unknown, 0),
        };

        DecodedInstruction {
            opcode,
            op,
            xo,
            form,
        }
    }

    /// Extended opcode for primary opcode 31, with the OE bit removed from XO-form arithmetic
    #[inline]
    pub fn extended_31(opcode: u32) -> u16 {
        let xo = ((opcode >> 1) & 0x3FF) as u16;
        let xo9 = xo & 0x1FF;
        if XO_FORM_OPS.contains(&xo9) {
            xo9
        } else {
            xo
        }
    }

    /// Extract D-form fields
    #[inline]
    pub fn d_form(opcode: u32) -> (u8, u8, i16) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let d = (opcode & 0xFFFF) as i16;
        (rt, ra, d)
    }

    /// Extract X-form fields
    #[inline]
    pub fn x_form(opcode: u32) -> (u8, u8, u8, u16, bool) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let xo = ((opcode >> 1) & 0x3FF) as u16;
        let rc = (opcode & 1) != 0;
        (rt, ra, rb, xo, rc)
    }

    /// Extract XO-form fields (integer arithmetic)
    #[inline]
    pub fn xo_form(opcode: u32) -> (u8, u8, u8, bool, u16, bool) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let oe = ((opcode >> 10) & 1) != 0;
        let xo = ((opcode >> 1) & 0x1FF) as u16;
        let rc = (opcode & 1) != 0;
        (rt, ra, rb, oe, xo, rc)
    }

    /// Extract I-form fields (branch)
    #[inline]
    pub fn i_form(opcode: u32) -> (i32, bool, bool) {
        let li = ((opcode & 0x03FF_FFFC) << 6) as i32 >> 6;
        let aa = ((opcode >> 1) & 1) != 0;
        let lk = (opcode & 1) != 0;
        (li, aa, lk)
    }

    /// Extract B-form fields (conditional branch)
    #[inline]
    pub fn b_form(opcode: u32) -> (u8, u8, i16, bool, bool) {
        let bo = ((opcode >> 21) & 0x1F) as u8;
        let bi = ((opcode >> 16) & 0x1F) as u8;
        let bd = (opcode & 0xFFFC) as u16 as i16;
        let aa = ((opcode >> 1) & 1) != 0;
        let lk = (opcode & 1) != 0;
        (bo, bi, bd, aa, lk)
    }

    /// Extract M-form fields (rotate)
    #[inline]
    pub fn m_form(opcode: u32) -> (u8, u8, u8, u8, u8, bool) {
        let rs = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let mb = ((opcode >> 6) & 0x1F) as u8;
        let me = ((opcode >> 1) & 0x1F) as u8;
        let rc = (opcode & 1) != 0;
        (rs, ra, rb, mb, me, rc)
    }

    /// Extract A-form fields (frt, fra, frb, frc, rc)
    #[inline]
    pub fn a_form(opcode: u32) -> (u8, u8, u8, u8, bool) {
        let frt = ((opcode >> 21) & 0x1F) as u8;
        let fra = ((opcode >> 16) & 0x1F) as u8;
        let frb = ((opcode >> 11) & 0x1F) as u8;
        let frc = ((opcode >> 6) & 0x1F) as u8;
        let rc = (opcode & 1) != 0;
        (frt, fra, frb, frc, rc)
    }

    /// SPR number of mfspr/mtspr (the two 5-bit halves are swapped in the encoding)
    #[inline]
    pub fn spr_field(opcode: u32) -> usize {
        let raw = (opcode >> 11) & 0x3FF;
        (((raw & 0x1F) << 5) | (raw >> 5)) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_addi() {
        // addi r3, r0, 100
        let decoded = PpuDecoder::decode(0x3860_0064);
        assert_eq!(decoded.op, 14);
        assert_eq!(decoded.form, InstructionForm::D);
    }

    #[test]
    fn test_d_form_extract() {
        // addi r3, r1, 8
        let (rt, ra, d) = PpuDecoder::d_form(0x3861_0008);
        assert_eq!(rt, 3);
        assert_eq!(ra, 1);
        assert_eq!(d, 8);
    }

    #[test]
    fn test_i_form_branch() {
        // b 0x100
        let (li, aa, lk) = PpuDecoder::i_form(0x4800_0100);
        assert_eq!(li, 0x100);
        assert!(!aa);
        assert!(!lk);
        // b -4
        let (li, _, _) = PpuDecoder::i_form(0x4BFF_FFFC);
        assert_eq!(li, -4);
    }

    #[test]
    fn test_b_form_negative_displacement() {
        // bdnz -8
        let (bo, _, bd, _, _) = PpuDecoder::b_form(0x4200_FFF8);
        assert_eq!(bo, 16);
        assert_eq!(bd, -8);
    }

    #[test]
    fn test_xo_form_oe_bit_masked() {
        // add r3, r4, r5 and addo r3, r4, r5
        assert_eq!(PpuDecoder::decode(0x7C64_2A14).xo, 266);
        assert_eq!(PpuDecoder::decode(0x7C64_2E14).xo, 266);
        // srw keeps its full 10-bit opcode
        assert_eq!(PpuDecoder::decode(0x7C64_2C30).xo, 536);
    }

    #[test]
    fn test_spr_field() {
        // mflr r0
        assert_eq!(PpuDecoder::spr_field(0x7C08_02A6), 8);
        // mtctr r3
        assert_eq!(PpuDecoder::spr_field(0x7C69_03A6), 9);
    }
}
