//! Cached interpreter backend
//!
//! Blocks are stored as packed descriptors `[selector][operands]`. Running a
//! block walks the descriptors and calls the callback named by each selector;
//! a callback returns the byte distance to the next descriptor, or zero once
//! the block is done. This backend never links blocks and never uses fastmem.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use og_core::config::CpuBackend;
use og_core::error::JitError;
use og_ppu::{AnalyzedBlock, ExceptionKind, InstructionFlags, Step};

use super::{invariant, BlockExit, ExecEnv, JitBackend, TranslateOptions, Translation};
use crate::code_region::{HostAddr, TRAP_FILL};
use crate::host::{Emitter, GuardArgs, InterpretArgs, MemArgs};

mod selector {
    pub const END: u8 = 0;
    pub const CHECK_BREAKPOINT: u8 = 1;
    pub const CHECK_FPU: u8 = 2;
    pub const INTERPRET: u8 = 3;
    pub const CHECK_WATCH: u8 = 4;
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct EndArgs {
    fallthrough: u32,
    cycles: u32,
}

/// Walk state of one run
struct Walk {
    taken: Option<u32>,
    exit: BlockExit,
}

type Callback = fn(&mut Walk, &mut ExecEnv<'_>, &[u8]) -> usize;

const CALLBACKS: [Callback; 5] = [end, check_breakpoint, check_fpu, interpret, check_watch];

const OPERAND_SIZES: [usize; 5] = [
    size_of::<EndArgs>(),
    size_of::<GuardArgs>(),
    size_of::<GuardArgs>(),
    size_of::<InterpretArgs>(),
    size_of::<MemArgs>(),
];

const MAX_OPERANDS: usize = size_of::<MemArgs>();

fn end(walk: &mut Walk, env: &mut ExecEnv<'_>, operands: &[u8]) -> usize {
    let args: EndArgs = bytemuck::pod_read_unaligned(operands);
    env.state.downcount -= args.cycles as i64;
    env.state.pc = walk.taken.take().unwrap_or(args.fallthrough);
    walk.exit = BlockExit::Normal;
    0
}

fn check_breakpoint(walk: &mut Walk, env: &mut ExecEnv<'_>, operands: &[u8]) -> usize {
    let args: GuardArgs = bytemuck::pod_read_unaligned(operands);
    if env.breakpoint_hit(args.pc) {
        env.halt_before(args.pc, args.cycles);
        walk.exit = BlockExit::Breakpoint(args.pc);
        return 0;
    }
    1 + operands.len()
}

fn check_watch(walk: &mut Walk, env: &mut ExecEnv<'_>, operands: &[u8]) -> usize {
    let args: MemArgs = bytemuck::pod_read_unaligned(operands);
    let pc = args.pc;
    let hit = args.access().and_then(|access| env.watchpoint_hit(pc, &access));
    if let Some(addr) = hit {
        env.halt_before(pc, args.cycles);
        walk.exit = BlockExit::Watchpoint { pc, addr };
        return 0;
    }
    1 + operands.len()
}

fn check_fpu(walk: &mut Walk, env: &mut ExecEnv<'_>, operands: &[u8]) -> usize {
    let args: GuardArgs = bytemuck::pod_read_unaligned(operands);
    if !env.fpu_enabled() {
        walk.exit = env.raise(args.pc, args.cycles, ExceptionKind::FpUnavailable);
        return 0;
    }
    1 + operands.len()
}

fn interpret(walk: &mut Walk, env: &mut ExecEnv<'_>, operands: &[u8]) -> usize {
    let args: InterpretArgs = bytemuck::pod_read_unaligned(operands);
    let address = args.pc;
    env.state.pc = address;
    match env.semantics.execute(env.state, env.memory, address, args.opcode) {
        Step::Next => {}
        Step::Jump(target) => walk.taken = Some(target),
        Step::Exception(kind) => {
            walk.exit = env.raise(address, args.cycles, kind);
            return 0;
        }
    }
    1 + operands.len()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CachedInterpreter;

impl CachedInterpreter {
    pub fn new() -> Self {
        Self
    }
}

impl JitBackend for CachedInterpreter {
    fn kind(&self) -> CpuBackend {
        CpuBackend::CachedInterpreter
    }

    fn max_code_size(&self, block: &AnalyzedBlock, options: &TranslateOptions<'_>) -> usize {
        let guard = 1 + OPERAND_SIZES[selector::CHECK_BREAKPOINT as usize];
        let interpret = 1 + OPERAND_SIZES[selector::INTERPRET as usize];
        let watch = if options.memcheck {
            1 + OPERAND_SIZES[selector::CHECK_WATCH as usize]
        } else {
            0
        };
        block.instructions.len() * (2 * guard + watch + interpret) + 1 + OPERAND_SIZES[selector::END as usize]
    }

    fn translate(
        &self,
        block: &AnalyzedBlock,
        options: &TranslateOptions<'_>,
        emitter: &mut Emitter,
    ) -> Result<Translation, JitError> {
        let mut cycles = 0u32;
        let mut fpu_checked = false;
        for inst in &block.instructions {
            let before = cycles;
            cycles += inst.cycles;
            if options.breakpoints.contains(&inst.address) {
                let args = GuardArgs {
                    pc: inst.address,
                    cycles: before,
                };
                emitter.raw(selector::CHECK_BREAKPOINT, bytemuck::bytes_of(&args));
            }
            if inst.flags.contains(InstructionFlags::USES_FPU) && !fpu_checked {
                let args = GuardArgs {
                    pc: inst.address,
                    cycles,
                };
                emitter.raw(selector::CHECK_FPU, bytemuck::bytes_of(&args));
                fpu_checked = true;
            }
            if let (true, Some(access)) = (options.memcheck, &inst.access) {
                let args = MemArgs::new(access, inst.address, before);
                emitter.raw(selector::CHECK_WATCH, bytemuck::bytes_of(&args));
            }
            let args = InterpretArgs {
                pc: inst.address,
                opcode: inst.opcode,
                cycles,
            };
            emitter.raw(selector::INTERPRET, bytemuck::bytes_of(&args));
        }
        let args = EndArgs {
            fallthrough: block.next_pc,
            cycles,
        };
        emitter.raw(selector::END, bytemuck::bytes_of(&args));

        if emitter.has_write_failed() {
            return Err(JitError::OutOfCodeSpace {
                requested: self.max_code_size(block, options),
                largest_free: emitter.len(),
            });
        }
        Ok(Translation::default())
    }

    fn run(&self, env: &mut ExecEnv<'_>, entry: HostAddr) -> Result<BlockExit, JitError> {
        let mut walk = Walk {
            taken: None,
            exit: BlockExit::Normal,
        };
        let mut at = entry;
        let mut operands = [0u8; MAX_OPERANDS];
        loop {
            let bytes = env
                .code
                .bytes_from(at)
                .ok_or_else(|| invariant(format!("descriptor {:#x} outside the code space", at)))?;
            let tag = *bytes
                .first()
                .ok_or_else(|| invariant(format!("descriptor {:#x} runs off the region", at)))?;
            if tag == TRAP_FILL {
                return Err(invariant(format!("executed trap filler at host {:#x}", at)));
            }
            let (Some(callback), Some(&len)) = (
                CALLBACKS.get(tag as usize),
                OPERAND_SIZES.get(tag as usize),
            ) else {
                return Err(invariant(format!("unknown selector {} at host {:#x}", tag, at)));
            };
            let raw = bytes
                .get(1..1 + len)
                .ok_or_else(|| invariant(format!("truncated descriptor at host {:#x}", at)))?;
            operands[..len].copy_from_slice(raw);

            match callback(&mut walk, env, &operands[..len]) {
                0 => return Ok(walk.exit),
                distance => at += distance as HostAddr,
            }
        }
    }

    fn disassemble(&self, code: &[u8], base: HostAddr) -> Vec<String> {
        let mut lines = Vec::new();
        let mut offset = 0;
        while let Some(&tag) = code.get(offset) {
            let addr = base + offset as u32;
            let Some(&len) = OPERAND_SIZES.get(tag as usize) else {
                lines.push(format!("{:08x}: .byte 0x{:02x}", addr, tag));
                offset += 1;
                continue;
            };
            let Some(raw) = code.get(offset + 1..offset + 1 + len) else {
                break;
            };
            let text = match tag {
                selector::END => {
                    let args: EndArgs = bytemuck::pod_read_unaligned(raw);
                    format!("end next={:08x} cycles={}", { args.fallthrough }, { args.cycles })
                }
                selector::CHECK_BREAKPOINT => {
                    let args: GuardArgs = bytemuck::pod_read_unaligned(raw);
                    format!("check_breakpoint pc={:08x}", { args.pc })
                }
                selector::CHECK_FPU => {
                    let args: GuardArgs = bytemuck::pod_read_unaligned(raw);
                    format!("check_fpu pc={:08x}", { args.pc })
                }
                selector::CHECK_WATCH => {
                    let args: MemArgs = bytemuck::pod_read_unaligned(raw);
                    format!("check_watch pc={:08x} size={}", { args.pc }, { args.size })
                }
                _ => {
                    let args: InterpretArgs = bytemuck::pod_read_unaligned(raw);
                    format!("interpret pc={:08x} op={:08x}", { args.pc }, { args.opcode })
                }
            };
            lines.push(format!("{:08x}: {}", addr, text));
            offset += 1 + len;
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use og_memory::{AddressSpace, MemoryBus, PageFlags};
    use og_ppu::{InstructionAnalyzer, PpuAnalyzer};
    use std::collections::BTreeSet;

    #[test]
    fn test_descriptors_per_instruction() {
        let mut memory = MemoryBus::empty();
        memory.map_ram(0, 0x10000, PageFlags::RWX).unwrap();
        memory
            .load_program(0x1000, &[0x3860_0001, 0x8064_0000, 0x4E80_0020])
            .unwrap();
        let block = PpuAnalyzer.analyze(&memory, AddressSpace::Physical, 0x1000, 64);
        let breakpoints = BTreeSet::new();
        let options = TranslateOptions {
            fastmem: true,
            mmu: false,
            memcheck: false,
            mode: 0,
            breakpoints: &breakpoints,
        };
        let mut emitter = Emitter::new(0x200, 4096);
        let translation = CachedInterpreter.translate(&block, &options, &mut emitter).unwrap();
        assert!(translation.exits.is_empty());
        assert!(translation.sites.is_empty());
        assert!(emitter.len() <= CachedInterpreter.max_code_size(&block, &options));

        let listing = CachedInterpreter.disassemble(emitter.bytes(), 0x200);
        assert_eq!(listing.len(), 4);
        assert!(listing[1].contains("interpret pc=00001004 op=80640000"));
        assert!(listing[3].contains("end next=0000100c"));
    }

    #[test]
    fn test_memcheck_descriptor_precedes_access() {
        let mut memory = MemoryBus::empty();
        memory.map_ram(0, 0x10000, PageFlags::RWX).unwrap();
        memory
            .load_program(0x1000, &[0x3860_0001, 0x9064_0000, 0x4E80_0020])
            .unwrap();
        let block = PpuAnalyzer.analyze(&memory, AddressSpace::Physical, 0x1000, 64);
        let breakpoints = BTreeSet::new();
        let options = TranslateOptions {
            fastmem: false,
            mmu: false,
            memcheck: true,
            mode: 0,
            breakpoints: &breakpoints,
        };
        let mut emitter = Emitter::new(0, 4096);
        CachedInterpreter.translate(&block, &options, &mut emitter).unwrap();
        assert!(emitter.len() <= CachedInterpreter.max_code_size(&block, &options));

        let listing = CachedInterpreter.disassemble(emitter.bytes(), 0);
        assert_eq!(listing.len(), 5);
        assert!(listing[1].contains("check_watch pc=00001004 size=4"));
        assert!(listing[2].contains("interpret pc=00001004"));
    }
}
