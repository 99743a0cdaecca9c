//! Disassembler for Gekko instructions

use og_ppu::decoder::PpuDecoder;

/// Disassembled instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    /// Address of the instruction
    pub address: u32,
    /// Raw opcode
    pub opcode: u32,
    pub mnemonic: String,
    pub operands: String,
}

impl DisassembledInstruction {
    /// Mnemonic and operands, padded like an assembler listing
    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{:8} {}", self.mnemonic, self.operands)
        }
    }

    pub fn opcode_hex(&self) -> String {
        format!("{:08X}", self.opcode)
    }
}

impl std::fmt::Display for DisassembledInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}: {:08x}  {}", self.address, self.opcode, self.text())
    }
}

/// D-form loads and stores: primary opcode, mnemonic, floating-point register operand
const LOAD_STORE: [(u8, &str, bool); 20] = [
    (32, "lwz", false),
    (33, "lwzu", false),
    (34, "lbz", false),
    (35, "lbzu", false),
    (36, "stw", false),
    (37, "stwu", false),
    (38, "stb", false),
    (39, "stbu", false),
    (40, "lhz", false),
    (41, "lhzu", false),
    (42, "lha", false),
    (43, "lhau", false),
    (44, "sth", false),
    (45, "sthu", false),
    (46, "lmw", false),
    (47, "stmw", false),
    (48, "lfs", true),
    (50, "lfd", true),
    (52, "stfs", true),
    (54, "stfd", true),
];

/// X-form indexed loads and stores under primary opcode 31
const INDEXED: [(u16, &str); 20] = [
    (23, "lwzx"),
    (55, "lwzux"),
    (87, "lbzx"),
    (119, "lbzux"),
    (151, "stwx"),
    (183, "stwux"),
    (215, "stbx"),
    (247, "stbux"),
    (279, "lhzx"),
    (311, "lhzux"),
    (343, "lhax"),
    (375, "lhaux"),
    (407, "sthx"),
    (439, "sthux"),
    (534, "lwbrx"),
    (662, "stwbrx"),
    (790, "lhbrx"),
    (918, "sthbrx"),
    (535, "lfsx"),
    (599, "lfdx"),
];

fn dot(mnemonic: &str, rc: bool) -> String {
    if rc {
        format!("{}.", mnemonic)
    } else {
        mnemonic.to_string()
    }
}

fn spr_name(spr: usize) -> String {
    match spr {
        1 => "xer".to_string(),
        8 => "lr".to_string(),
        9 => "ctr".to_string(),
        18 => "dsisr".to_string(),
        19 => "dar".to_string(),
        22 => "dec".to_string(),
        26 => "srr0".to_string(),
        27 => "srr1".to_string(),
        272..=275 => format!("sprg{}", spr - 272),
        912..=919 => format!("gqr{}", spr - 912),
        1008 => "hid0".to_string(),
        1009 => "hid1".to_string(),
        920 => "hid2".to_string(),
        _ => format!("spr{}", spr),
    }
}

/// Gekko instruction disassembler
pub struct PpcDisassembler;

impl PpcDisassembler {
    /// Disassemble a single instruction
    pub fn disassemble(address: u32, opcode: u32) -> DisassembledInstruction {
        let decoded = PpuDecoder::decode(opcode);
        let (rt, ra, d) = PpuDecoder::d_form(opcode);
        let uimm = opcode & 0xFFFF;

        let (mnemonic, operands) = match decoded.op {
            18 => {
                let (li, aa, lk) = PpuDecoder::i_form(opcode);
                let target = if aa { li as u32 } else { address.wrapping_add(li as u32) };
                let mnemonic = match (aa, lk) {
                    (false, false) => "b",
                    (false, true) => "bl",
                    (true, false) => "ba",
                    (true, true) => "bla",
                };
                (mnemonic.to_string(), format!("0x{:08x}", target))
            }
            16 => Self::branch_conditional(address, opcode),
            17 => ("sc".to_string(), String::new()),
            7 => ("mulli".to_string(), format!("r{}, r{}, {}", rt, ra, d)),
            8 => ("subfic".to_string(), format!("r{}, r{}, {}", rt, ra, d)),
            10 => ("cmplwi".to_string(), format!("cr{}, r{}, {}", rt >> 2, ra, uimm)),
            11 => ("cmpwi".to_string(), format!("cr{}, r{}, {}", rt >> 2, ra, d)),
            12 => ("addic".to_string(), format!("r{}, r{}, {}", rt, ra, d)),
            13 => ("addic.".to_string(), format!("r{}, r{}, {}", rt, ra, d)),
            14 if ra == 0 => ("li".to_string(), format!("r{}, {}", rt, d)),
            14 => ("addi".to_string(), format!("r{}, r{}, {}", rt, ra, d)),
            15 if ra == 0 => ("lis".to_string(), format!("r{}, 0x{:x}", rt, uimm)),
            15 => ("addis".to_string(), format!("r{}, r{}, 0x{:x}", rt, ra, uimm)),
            24 if opcode == 0x6000_0000 => ("nop".to_string(), String::new()),
            24..=29 => {
                let mnemonic = ["ori", "oris", "xori", "xoris", "andi.", "andis."][(decoded.op - 24) as usize];
                (mnemonic.to_string(), format!("r{}, r{}, 0x{:x}", ra, rt, uimm))
            }
            20 | 21 | 23 => {
                let (rs, ra, sh, mb, me, rc) = PpuDecoder::m_form(opcode);
                match decoded.op {
                    20 => (dot("rlwimi", rc), format!("r{}, r{}, {}, {}, {}", ra, rs, sh, mb, me)),
                    21 if mb == 0 && me == 31 - sh => (dot("slwi", rc), format!("r{}, r{}, {}", ra, rs, sh)),
                    21 => (dot("rlwinm", rc), format!("r{}, r{}, {}, {}, {}", ra, rs, sh, mb, me)),
                    _ => (dot("rlwnm", rc), format!("r{}, r{}, r{}, {}, {}", ra, rs, sh, mb, me)),
                }
            }
            19 => Self::op19(opcode, decoded.xo),
            31 => Self::op31(opcode, decoded.xo),
            59 | 63 => Self::float(opcode, decoded.op, decoded.xo),
            op => match LOAD_STORE.iter().find(|(code, _, _)| *code == op) {
                Some((_, mnemonic, fp)) => {
                    let reg = if *fp { 'f' } else { 'r' };
                    (mnemonic.to_string(), format!("{}{}, {}(r{})", reg, rt, d, ra))
                }
                None => ("???".to_string(), format!("op={}", op)),
            },
        };

        DisassembledInstruction {
            address,
            opcode,
            mnemonic,
            operands,
        }
    }

    fn branch_conditional(address: u32, opcode: u32) -> (String, String) {
        let (bo, bi, bd, aa, lk) = PpuDecoder::b_form(opcode);
        let target = if aa {
            bd as i32 as u32
        } else {
            address.wrapping_add(bd as i32 as u32)
        };
        let suffix = if lk { "l" } else { "" };
        let cr = bi >> 2;
        let condition = ["lt", "gt", "eq", "so"][(bi & 3) as usize];
        let negated = ["ge", "le", "ne", "ns"][(bi & 3) as usize];

        let simplified = match bo & 0x1E {
            16 => Some("bdnz".to_string()),
            18 => Some("bdz".to_string()),
            12 => Some(format!("b{}", condition)),
            4 => Some(format!("b{}", negated)),
            _ => None,
        };
        match simplified {
            Some(mnemonic) if bo & 0x14 == 0x10 || cr == 0 => {
                (format!("{}{}", mnemonic, suffix), format!("0x{:08x}", target))
            }
            Some(mnemonic) => (format!("{}{}", mnemonic, suffix), format!("cr{}, 0x{:08x}", cr, target)),
            None => (format!("bc{}", suffix), format!("{}, {}, 0x{:08x}", bo, bi, target)),
        }
    }

    fn op19(opcode: u32, xo: u16) -> (String, String) {
        let bo = ((opcode >> 21) & 0x1F) as u8;
        let bi = ((opcode >> 16) & 0x1F) as u8;
        let bb = ((opcode >> 11) & 0x1F) as u8;
        let lk = opcode & 1 != 0;

        match xo {
            16 | 528 => {
                let target = if xo == 16 { "lr" } else { "ctr" };
                let mnemonic = if bo & 0x14 == 0x14 {
                    format!("b{}", target)
                } else {
                    format!("bc{}", target)
                };
                let mnemonic = if lk { format!("{}l", mnemonic) } else { mnemonic };
                if bo & 0x14 == 0x14 {
                    (mnemonic, String::new())
                } else {
                    (mnemonic, format!("{}, {}", bo, bi))
                }
            }
            0 => ("mcrf".to_string(), format!("cr{}, cr{}", bo >> 2, bi >> 2)),
            50 => ("rfi".to_string(), String::new()),
            150 => ("isync".to_string(), String::new()),
            33 | 129 | 193 | 225 | 257 | 289 | 417 | 449 => {
                let mnemonic = match xo {
                    33 => "crnor",
                    129 => "crandc",
                    193 => "crxor",
                    225 => "crnand",
                    257 => "crand",
                    289 => "creqv",
                    417 => "crorc",
                    _ => "cror",
                };
                (mnemonic.to_string(), format!("{}, {}, {}", bo, bi, bb))
            }
            _ => ("???".to_string(), format!("op19 xo={}", xo)),
        }
    }

    fn op31(opcode: u32, xo: u16) -> (String, String) {
        let (rt, ra, rb, _, rc) = PpuDecoder::x_form(opcode);
        let (_, _, _, oe, _, _) = PpuDecoder::xo_form(opcode);
        let arith = |name: &str| {
            let name = if oe { format!("{}o", name) } else { name.to_string() };
            (dot(&name, rc), format!("r{}, r{}, r{}", rt, ra, rb))
        };
        let logical = |name: &str| (dot(name, rc), format!("r{}, r{}, r{}", ra, rt, rb));
        let unary = |name: &str| (dot(name, rc), format!("r{}, r{}", ra, rt));

        match xo {
            266 => arith("add"),
            10 => arith("addc"),
            138 => arith("adde"),
            40 => arith("subf"),
            8 => arith("subfc"),
            136 => arith("subfe"),
            235 => arith("mullw"),
            75 => arith("mulhw"),
            11 => arith("mulhwu"),
            491 => arith("divw"),
            459 => arith("divwu"),
            104 => (dot(if oe { "nego" } else { "neg" }, rc), format!("r{}, r{}", rt, ra)),
            202 => (dot("addze", rc), format!("r{}, r{}", rt, ra)),
            234 => (dot("addme", rc), format!("r{}, r{}", rt, ra)),
            200 => (dot("subfze", rc), format!("r{}, r{}", rt, ra)),
            232 => (dot("subfme", rc), format!("r{}, r{}", rt, ra)),
            444 if rt == rb => (dot("mr", rc), format!("r{}, r{}", ra, rt)),
            444 => logical("or"),
            124 if rt == rb => unary("not"),
            124 => logical("nor"),
            28 => logical("and"),
            60 => logical("andc"),
            316 => logical("xor"),
            412 => logical("orc"),
            476 => logical("nand"),
            284 => logical("eqv"),
            24 => logical("slw"),
            536 => logical("srw"),
            792 => logical("sraw"),
            824 => (dot("srawi", rc), format!("r{}, r{}, {}", ra, rt, rb)),
            26 => unary("cntlzw"),
            922 => unary("extsh"),
            954 => unary("extsb"),
            0 => ("cmpw".to_string(), format!("cr{}, r{}, r{}", rt >> 2, ra, rb)),
            32 => ("cmplw".to_string(), format!("cr{}, r{}, r{}", rt >> 2, ra, rb)),
            339 => (
                "mfspr".to_string(),
                format!("r{}, {}", rt, spr_name(PpuDecoder::spr_field(opcode))),
            ),
            467 => (
                "mtspr".to_string(),
                format!("{}, r{}", spr_name(PpuDecoder::spr_field(opcode)), rt),
            ),
            19 => ("mfcr".to_string(), format!("r{}", rt)),
            83 => ("mfmsr".to_string(), format!("r{}", rt)),
            146 => ("mtmsr".to_string(), format!("r{}", rt)),
            144 => ("mtcrf".to_string(), format!("0x{:02x}, r{}", (opcode >> 12) & 0xFF, rt)),
            1014 => ("dcbz".to_string(), format!("r{}, r{}", ra, rb)),
            54 | 86 | 246 | 278 | 470 | 982 => {
                let mnemonic = match xo {
                    54 => "dcbst",
                    86 => "dcbf",
                    246 => "dcbtst",
                    278 => "dcbt",
                    470 => "dcbi",
                    _ => "icbi",
                };
                (mnemonic.to_string(), format!("r{}, r{}", ra, rb))
            }
            598 => ("sync".to_string(), String::new()),
            854 => ("eieio".to_string(), String::new()),
            _ => match INDEXED.iter().find(|(code, _)| *code == xo) {
                Some((code, mnemonic)) => {
                    let reg = if matches!(code, 535 | 599) { 'f' } else { 'r' };
                    (mnemonic.to_string(), format!("{}{}, r{}, r{}", reg, rt, ra, rb))
                }
                None => ("???".to_string(), format!("op31 xo={}", xo)),
            },
        }
    }

    fn float(opcode: u32, op: u8, xo: u16) -> (String, String) {
        let (frt, fra, frb, frc, rc) = PpuDecoder::a_form(opcode);
        let single = if op == 59 { "s" } else { "" };
        let three = |name: &str, b: u8| (dot(&format!("{}{}", name, single), rc), format!("f{}, f{}, f{}", frt, fra, b));
        let fused = |name: &str| {
            (
                dot(&format!("{}{}", name, single), rc),
                format!("f{}, f{}, f{}, f{}", frt, fra, frc, frb),
            )
        };
        let unary = |name: &str| (dot(name, rc), format!("f{}, f{}", frt, frb));

        match xo {
            18 => three("fdiv", frb),
            20 => three("fsub", frb),
            21 => three("fadd", frb),
            25 => three("fmul", frc),
            28 => fused("fmsub"),
            29 => fused("fmadd"),
            30 => fused("fnmsub"),
            31 => fused("fnmadd"),
            24 if op == 59 => unary("fres"),
            26 if op == 63 => unary("frsqrte"),
            0 => ("fcmpu".to_string(), format!("cr{}, f{}, f{}", frt >> 2, fra, frb)),
            32 => ("fcmpo".to_string(), format!("cr{}, f{}, f{}", frt >> 2, fra, frb)),
            12 => unary("frsp"),
            14 => unary("fctiw"),
            15 => unary("fctiwz"),
            40 => unary("fneg"),
            72 => unary("fmr"),
            136 => unary("fnabs"),
            264 => unary("fabs"),
            583 => (dot("mffs", rc), format!("f{}", frt)),
            711 => (dot("mtfsf", rc), format!("0x{:02x}, f{}", (opcode >> 17) & 0xFF, frb)),
            _ => ("???".to_string(), format!("op{} xo={}", op, xo)),
        }
    }

    /// Disassemble big-endian instruction words
    pub fn disassemble_range(bytes: &[u8], base_address: u32) -> Vec<DisassembledInstruction> {
        bytes
            .chunks_exact(4)
            .enumerate()
            .map(|(i, word)| {
                let opcode = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
                Self::disassemble(base_address.wrapping_add(i as u32 * 4), opcode)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_immediates() {
        assert_eq!(PpcDisassembler::disassemble(0, 0x3860_0001).text(), "li       r3, 1");
        assert_eq!(PpcDisassembler::disassemble(0, 0x3863_FFFF).text(), "addi     r3, r3, -1");
        assert_eq!(PpcDisassembler::disassemble(0, 0x3CA0_3860).text(), "lis      r5, 0x3860");
        assert_eq!(PpcDisassembler::disassemble(0, 0x6000_0000).text(), "nop");
    }

    #[test]
    fn test_branches() {
        let b = PpcDisassembler::disassemble(0x1014, 0x4800_0FEC);
        assert_eq!(b.mnemonic, "b");
        assert_eq!(b.operands, "0x00002000");

        let bdnz = PpcDisassembler::disassemble(0x1018, 0x4200_FFF8);
        assert_eq!(bdnz.mnemonic, "bdnz");
        assert_eq!(bdnz.operands, "0x00001010");

        // beq cr0
        let beq = PpcDisassembler::disassemble(0x1000, 0x4182_0010);
        assert_eq!(beq.mnemonic, "beq");
        assert_eq!(beq.operands, "0x00001010");

        assert_eq!(PpcDisassembler::disassemble(0, 0x4E80_0020).mnemonic, "blr");
        assert_eq!(PpcDisassembler::disassemble(0, 0x4E80_0421).mnemonic, "bctrl");
    }

    #[test]
    fn test_loads_and_stores() {
        assert_eq!(PpcDisassembler::disassemble(0, 0x8083_0000).text(), "lwz      r4, 0(r3)");
        assert_eq!(PpcDisassembler::disassemble(0, 0x9465_0004).text(), "stwu     r3, 4(r5)");
        assert_eq!(PpcDisassembler::disassemble(0, 0xC821_0008).text(), "lfd      f1, 8(r1)");
    }

    #[test]
    fn test_extended_forms() {
        assert_eq!(PpcDisassembler::disassemble(0, 0x7CC4_2A14).text(), "add      r6, r4, r5");
        assert_eq!(PpcDisassembler::disassemble(0, 0x7C89_03A6).text(), "mtspr    ctr, r4");
        assert_eq!(PpcDisassembler::disassemble(0, 0xFC22_182A).text(), "fadd     f1, f2, f3");
        assert_eq!(PpcDisassembler::disassemble(0, 0x0000_0000).mnemonic, "???");
    }

    #[test]
    fn test_range_listing() {
        let bytes = [0x38, 0x60, 0x00, 0x01, 0x4E, 0x80, 0x00, 0x20];
        let listing = PpcDisassembler::disassemble_range(&bytes, 0x8000_3000);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[1].address, 0x8000_3004);
        assert_eq!(listing[1].to_string(), "80003004: 4e800020  blr");
    }
}
