//! Recompiler backend
//!
//! Loads and stores are emitted as native memory ops: optimistic fastmem
//! accesses with a backpatch site when fastmem is usable, explicit slow-path
//! accesses otherwise. Every other instruction falls back to the interpreter
//! semantics. Blocks end in an exit op carrying one link slot per static
//! successor, which lets execution chain from block to block without returning
//! to the dispatcher.

use og_core::config::CpuBackend;
use og_core::error::JitError;
use og_ppu::{AccessPath, AnalyzedBlock, ExceptionKind, InstructionFlags, PpuDecoder, Step};

use super::{invariant, BlockExit, ExecEnv, JitBackend, SiteSpec, TranslateOptions, Translation};
use crate::code_region::HostAddr;
use crate::host::{self, decode, link_slots, size, Emitter, HostOp, MemArgs, UNLINKED};
use crate::trap::{HostContext, HostFault, TrapOutcome};

/// Branch-always bits of the BO field
const BO_ALWAYS: u8 = 0x14;

#[derive(Debug, Default, Clone, Copy)]
pub struct Recompiler;

impl Recompiler {
    pub fn new() -> Self {
        Self
    }
}

/// Static successors of a block, taken branch first
fn exit_targets(block: &AnalyzedBlock) -> Vec<u32> {
    let mut targets = Vec::with_capacity(2);
    let Some(last) = block.instructions.last() else {
        targets.push(block.next_pc);
        return targets;
    };
    if let Some(target) = last.branch_target {
        targets.push(target);
    }
    let decoded = PpuDecoder::decode(last.opcode);
    let falls_through = match decoded.op {
        18 => false,
        16 => {
            let (bo, ..) = PpuDecoder::b_form(last.opcode);
            bo & BO_ALWAYS != BO_ALWAYS
        }
        _ => true,
    };
    if falls_through && !targets.contains(&block.next_pc) {
        targets.push(block.next_pc);
    }
    targets
}

impl JitBackend for Recompiler {
    fn kind(&self) -> CpuBackend {
        CpuBackend::Recompiler
    }

    fn max_code_size(&self, block: &AnalyzedBlock, options: &TranslateOptions<'_>) -> usize {
        let watch = if options.memcheck { size::MEM } else { 0 };
        let per_instruction = 2 * size::GUARD + watch + size::MEM.max(size::INTERPRET);
        block.instructions.len() * per_instruction + size::EXIT + 2 * size::LINK_SLOT
    }

    fn translate(
        &self,
        block: &AnalyzedBlock,
        options: &TranslateOptions<'_>,
        emitter: &mut Emitter,
    ) -> Result<Translation, JitError> {
        let mut translation = Translation::default();
        let mut cycles = 0u32;
        let mut fpu_checked = false;

        for inst in &block.instructions {
            let before = cycles;
            cycles += inst.cycles;

            if options.breakpoints.contains(&inst.address) {
                emitter.check_breakpoint(inst.address, before);
            }
            // MSR[FP] cannot change inside a block, one check covers the rest
            if inst.flags.contains(InstructionFlags::USES_FPU) && !fpu_checked {
                emitter.check_fpu(inst.address, cycles);
                fpu_checked = true;
            }

            match &inst.access {
                Some(access) => {
                    if options.memcheck {
                        emitter.check_watch(&MemArgs::new(access, inst.address, before));
                    }
                    let args = MemArgs::new(access, inst.address, cycles);
                    if options.native_memory() {
                        let host = emitter.position();
                        emitter.mem_fast(&args);
                        translation.sites.push(SiteSpec {
                            host,
                            len: emitter.position() - host,
                            access: args,
                        });
                    } else {
                        emitter.mem_slow(&args);
                    }
                }
                None => emitter.interpret(inst.address, inst.opcode, cycles),
            }
        }

        let targets = exit_targets(block);
        let slots = emitter.exit(block.next_pc, cycles, options.mode as u8, &targets);
        translation.exits = targets.into_iter().zip(slots).collect();

        if emitter.has_write_failed() {
            return Err(JitError::OutOfCodeSpace {
                requested: self.max_code_size(block, options),
                largest_free: emitter.len(),
            });
        }
        Ok(translation)
    }

    fn run(&self, env: &mut ExecEnv<'_>, entry: HostAddr) -> Result<BlockExit, JitError> {
        let mut pc = entry;
        let mut taken: Option<u32> = None;
        let mut context = HostContext::new(entry);

        loop {
            let bytes = env
                .code
                .bytes_from(pc)
                .ok_or_else(|| invariant(format!("host pc {:#x} outside the code space", pc)))?;
            let (op, len) = decode(bytes)
                .map_err(|e| invariant(format!("undecodable host op {:#04x} at {:#x}", e.tag, pc)))?;
            let next = pc + len as HostAddr;

            match op {
                HostOp::Nop => pc = next,
                HostOp::Trap => {
                    return Err(invariant(format!("executed trap filler at host {:#x}", pc)));
                }
                HostOp::CheckBreakpoint(guard) => {
                    if env.breakpoint_hit(guard.pc) {
                        env.halt_before(guard.pc, guard.cycles);
                        return Ok(BlockExit::Breakpoint(guard.pc));
                    }
                    pc = next;
                }
                HostOp::CheckWatch(args) => {
                    let access = args
                        .access()
                        .ok_or_else(|| invariant(format!("malformed access at host {:#x}", pc)))?;
                    if let Some(addr) = env.watchpoint_hit(args.pc, &access) {
                        env.halt_before(args.pc, args.cycles);
                        return Ok(BlockExit::Watchpoint { pc: args.pc, addr });
                    }
                    pc = next;
                }
                HostOp::CheckFpu(guard) => {
                    if !env.fpu_enabled() {
                        return Ok(env.raise(guard.pc, guard.cycles, ExceptionKind::FpUnavailable));
                    }
                    pc = next;
                }
                HostOp::Interpret(args) => {
                    let address = args.pc;
                    env.state.pc = address;
                    match env.semantics.execute(env.state, env.memory, address, args.opcode) {
                        Step::Next => {}
                        Step::Jump(target) => taken = Some(target),
                        Step::Exception(kind) => return Ok(env.raise(address, args.cycles, kind)),
                    }
                    pc = next;
                }
                HostOp::MemFast(args) => {
                    let access = args
                        .access()
                        .ok_or_else(|| invariant(format!("malformed access at host {:#x}", pc)))?;
                    if access.perform(env.state, env.memory, AccessPath::Fast).is_ok() {
                        pc = next;
                        continue;
                    }

                    let fault = HostFault {
                        host_pc: pc,
                        guest_addr: access.effective_address(env.state),
                        store: access.store,
                    };
                    context.pc = pc;
                    match env.traps.dispatch(&fault, &mut context, env.sites, env.code) {
                        TrapOutcome::Resume => pc = context.pc,
                        TrapOutcome::EmulateInline => {
                            if access.perform(env.state, env.memory, AccessPath::Slow).is_err() {
                                return Ok(env.guest_fault(&args, fault.guest_addr));
                            }
                            pc = context.pc;
                        }
                        TrapOutcome::NotHandled => {
                            og_core::jit_debug!("{}", JitError::BackpatchSiteMismatch { host: pc });
                            return Ok(env.guest_fault(&args, fault.guest_addr));
                        }
                    }
                }
                HostOp::MemSlow(args) => {
                    let access = args
                        .access()
                        .ok_or_else(|| invariant(format!("malformed access at host {:#x}", pc)))?;
                    if access.perform(env.state, env.memory, AccessPath::Slow).is_err() {
                        let addr = access.effective_address(env.state);
                        return Ok(env.guest_fault(&args, addr));
                    }
                    pc = next;
                }
                HostOp::SaveRegs(mask) => {
                    context.saved.push(mask);
                    pc = next;
                }
                HostOp::RestoreRegs(mask) => {
                    if context.saved.pop() != Some(mask) {
                        return Err(invariant(format!("unbalanced register restore at host {:#x}", pc)));
                    }
                    pc = next;
                }
                HostOp::Jump(target) => pc = target,
                HostOp::Exit(args) => {
                    let slots = link_slots(bytes, &args);
                    env.state.downcount -= args.cycles as i64;
                    let destination = taken.take().unwrap_or(args.fallthrough);
                    env.state.pc = destination;

                    if env.may_chain(args.mode) {
                        let linked = slots
                            .iter()
                            .find(|slot| { slot.target } == destination && { slot.entry } != UNLINKED)
                            .map(|slot| slot.entry);
                        if let Some(entry) = linked {
                            env.enter_chained(entry);
                            pc = entry;
                            continue;
                        }
                    }
                    return Ok(BlockExit::Normal);
                }
            }
        }
    }

    fn disassemble(&self, code: &[u8], base: HostAddr) -> Vec<String> {
        host::disassemble(code, base)
    }
}
