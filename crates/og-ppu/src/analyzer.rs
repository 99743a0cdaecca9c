//! Block analysis
//!
//! Splits the guest instruction stream into translation units and annotates each
//! instruction with the properties the translator needs.

use bitflags::bitflags;
use og_memory::{AddressSpace, MemoryBus};

use crate::access::MemAccess;
use crate::decoder::PpuDecoder;

bitflags! {
    /// Per-instruction properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstructionFlags: u32 {
        /// Reads or writes guest memory
        const TOUCHES_MEMORY = 1 << 0;
        /// May raise a synchronous exception
        const CAN_FAULT      = 1 << 1;
        /// Control leaves the straight-line stream after this instruction
        const ENDS_BLOCK     = 1 << 2;
        /// Requires MSR[FP]
        const USES_FPU       = 1 << 3;
        /// Branch instruction
        const BRANCH         = 1 << 4;
        /// Changes MSR
        const WRITES_MSR     = 1 << 5;
    }
}

/// One analyzed guest instruction
#[derive(Debug, Clone)]
pub struct AnalyzedInstruction {
    pub address: u32,
    pub opcode: u32,
    /// Cycle cost charged against the downcount
    pub cycles: u32,
    pub flags: InstructionFlags,
    /// Single load/store descriptor, when the instruction is one
    pub access: Option<MemAccess>,
    /// Statically known branch destination
    pub branch_target: Option<u32>,
}

/// A straight-line run of guest instructions starting at one address
#[derive(Debug, Clone)]
pub struct AnalyzedBlock {
    /// Effective start address
    pub start: u32,
    /// Physical address of the first instruction
    pub physical_start: u32,
    pub instructions: Vec<AnalyzedInstruction>,
    /// Address execution falls through to after the last instruction
    pub next_pc: u32,
    /// The first instruction could not be fetched
    pub memory_exception: bool,
}

impl AnalyzedBlock {
    /// Total cycle cost of the block
    pub fn cycles(&self) -> u32 {
        self.instructions.iter().map(|i| i.cycles).sum()
    }

    /// Size in bytes of the guest source range
    pub fn byte_len(&self) -> u32 {
        self.instructions.len() as u32 * 4
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Produces analyzed blocks from guest memory
pub trait InstructionAnalyzer {
    fn analyze(
        &self,
        memory: &MemoryBus,
        space: AddressSpace,
        start: u32,
        max_instructions: usize,
    ) -> AnalyzedBlock;
}

/// Gekko block analyzer
#[derive(Debug, Default, Clone, Copy)]
pub struct PpuAnalyzer;

impl PpuAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Annotate a single instruction
    pub fn classify(address: u32, opcode: u32) -> AnalyzedInstruction {
        let decoded = PpuDecoder::decode(opcode);
        let mut flags = InstructionFlags::empty();
        let mut cycles = 1;
        let mut branch_target = None;
        let access = MemAccess::from_opcode(opcode);

        if let Some(access) = &access {
            flags |= InstructionFlags::TOUCHES_MEMORY | InstructionFlags::CAN_FAULT;
            if access.is_float() {
                flags |= InstructionFlags::USES_FPU;
            }
        }

        match decoded.op {
            // b
            18 => {
                let (li, aa, _) = PpuDecoder::i_form(opcode);
                let target = if aa { li as u32 } else { address.wrapping_add(li as u32) };
                branch_target = Some(target);
                flags |= InstructionFlags::BRANCH | InstructionFlags::ENDS_BLOCK;
            }
            // bc
            16 => {
                let (_, _, bd, aa, _) = PpuDecoder::b_form(opcode);
                let target = if aa {
                    bd as i32 as u32
                } else {
                    address.wrapping_add(bd as i32 as u32)
                };
                branch_target = Some(target);
                flags |= InstructionFlags::BRANCH | InstructionFlags::ENDS_BLOCK;
            }
            // sc
            17 => {
                flags |= InstructionFlags::CAN_FAULT | InstructionFlags::ENDS_BLOCK;
                cycles = 2;
            }
            19 => match decoded.xo {
                // bclr, bcctr
                16 | 528 => flags |= InstructionFlags::BRANCH | InstructionFlags::ENDS_BLOCK,
                // rfi
                50 => {
                    flags |= InstructionFlags::ENDS_BLOCK | InstructionFlags::WRITES_MSR;
                    cycles = 2;
                }
                // isync
                150 => flags |= InstructionFlags::ENDS_BLOCK,
                _ => {}
            },
            // lmw, stmw
            46 | 47 => {
                flags |= InstructionFlags::TOUCHES_MEMORY | InstructionFlags::CAN_FAULT;
                cycles = 2;
            }
            // mulli
            7 => cycles = 2,
            31 => match decoded.xo {
                // mtmsr
                146 => flags |= InstructionFlags::ENDS_BLOCK | InstructionFlags::WRITES_MSR,
                // mullw, mulhw, mulhwu
                235 | 75 | 11 => cycles = 2,
                // divw, divwu
                491 | 459 => cycles = 19,
                // dcbz, dcbi
                1014 | 470 => flags |= InstructionFlags::TOUCHES_MEMORY | InstructionFlags::CAN_FAULT,
                _ => {}
            },
            59 | 63 => {
                flags |= InstructionFlags::USES_FPU | InstructionFlags::CAN_FAULT;
            }
            // Paired singles are not implemented by the interpreter and raise Program
            4 => flags |= InstructionFlags::USES_FPU | InstructionFlags::CAN_FAULT,
            _ => {}
        }

        if flags.contains(InstructionFlags::USES_FPU) {
            flags |= InstructionFlags::CAN_FAULT;
        }

        AnalyzedInstruction {
            address,
            opcode,
            cycles,
            flags,
            access,
            branch_target,
        }
    }
}

impl InstructionAnalyzer for PpuAnalyzer {
    fn analyze(
        &self,
        memory: &MemoryBus,
        space: AddressSpace,
        start: u32,
        max_instructions: usize,
    ) -> AnalyzedBlock {
        let physical_start = memory.translate(space, start).unwrap_or(start);
        let mut block = AnalyzedBlock {
            start,
            physical_start,
            instructions: Vec::new(),
            next_pc: start,
            memory_exception: false,
        };

        let mut address = start;
        while block.instructions.len() < max_instructions.max(1) {
            let opcode = match memory.fetch(space, address) {
                Ok(opcode) => opcode,
                Err(e) => {
                    if block.instructions.is_empty() {
                        og_core::ppu_debug!("Instruction fetch failed at 0x{:08x}: {}", address, e);
                        block.memory_exception = true;
                    }
                    break;
                }
            };
            let inst = Self::classify(address, opcode);
            let ends = inst.flags.contains(InstructionFlags::ENDS_BLOCK);
            block.instructions.push(inst);
            address = address.wrapping_add(4);
            if ends {
                break;
            }
        }
        block.next_pc = address;
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use og_memory::PageFlags;

    fn memory_with(program: &[u32]) -> MemoryBus {
        let mut memory = MemoryBus::empty();
        memory.map_ram(0, 0x10000, PageFlags::RWX).unwrap();
        memory.load_program(0x1000, program).unwrap();
        memory
    }

    #[test]
    fn test_block_ends_at_branch() {
        let memory = memory_with(&[
            0x3860_0001, // li r3, 1
            0x8083_0000, // lwz r4, 0(r3)
            0x4800_0010, // b +0x10
            0x3860_0002, // li r3, 2
        ]);
        let block = PpuAnalyzer.analyze(&memory, AddressSpace::Physical, 0x1000, 64);
        assert_eq!(block.instructions.len(), 3);
        assert_eq!(block.next_pc, 0x100C);
        assert_eq!(block.instructions[2].branch_target, Some(0x1018));
        assert!(block.instructions[1].flags.contains(InstructionFlags::TOUCHES_MEMORY));
        assert!(block.instructions[1].access.is_some());
        assert!(!block.memory_exception);
    }

    #[test]
    fn test_block_respects_max_length() {
        let memory = memory_with(&[0x6000_0000; 8]);
        let block = PpuAnalyzer.analyze(&memory, AddressSpace::Physical, 0x1000, 3);
        assert_eq!(block.instructions.len(), 3);
        assert_eq!(block.next_pc, 0x100C);
    }

    #[test]
    fn test_unfetchable_start_sets_memory_exception() {
        let memory = memory_with(&[]);
        let block = PpuAnalyzer.analyze(&memory, AddressSpace::Physical, 0x0080_0000, 64);
        assert!(block.memory_exception);
        assert!(block.is_empty());
    }

    #[test]
    fn test_logical_block_records_physical_start() {
        let memory = memory_with(&[0x4E80_0020]);
        let block = PpuAnalyzer.analyze(&memory, AddressSpace::Logical, 0x8000_1000, 64);
        assert_eq!(block.physical_start, 0x1000);
        assert_eq!(block.instructions.len(), 1);
    }

    #[test]
    fn test_fpu_instructions_flagged() {
        // fadd f1, f2, f3
        let inst = PpuAnalyzer::classify(0, 0xFC22_182A);
        assert!(inst.flags.contains(InstructionFlags::USES_FPU));
        // lfd f1, 0(r3)
        let inst = PpuAnalyzer::classify(0, 0xC823_0000);
        assert!(inst.flags.contains(InstructionFlags::USES_FPU | InstructionFlags::TOUCHES_MEMORY));
    }

    #[test]
    fn test_divide_costs_more() {
        // divw r3, r4, r5
        let inst = PpuAnalyzer::classify(0, 0x7C64_2BD6);
        assert_eq!(inst.cycles, 19);
    }
}
