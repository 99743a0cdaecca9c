//! Safe memory access backpatching
//!
//! Fast-path loads and stores are emitted optimistically as direct fastmem
//! accesses and recorded as sites. The first time a site faults, a trampoline
//! that saves the live registers, performs the access through the slow path and
//! jumps back is generated in the far region, and the site's bytes are replaced
//! by a jump to it. Patched sites never fault again.

use std::collections::BTreeMap;

use og_core::error::JitError;

use crate::block::BlockId;
use crate::code_region::{CodeRegion, CodeSpace, HostAddr, HostRange, TRAP_FILL};
use crate::host::{size, Emitter, MemArgs};
use crate::trap::{HostContext, HostFault, TrapHandler, TrapOutcome};

/// Patch state of a site; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    FastPath,
    Patching,
    SlowPath,
}

/// A recorded fast-path access
#[derive(Debug, Clone)]
pub struct BackpatchSite {
    pub host: HostAddr,
    pub len: u32,
    pub guest_pc: u32,
    pub access: MemArgs,
    /// Registers the slow path must preserve around the call
    pub live_regs: u64,
    pub owner: BlockId,
    pub state: SiteState,
    pub trampoline: Option<HostRange>,
}

impl BackpatchSite {
    pub fn new(host: HostAddr, len: u32, access: MemArgs, owner: BlockId) -> Self {
        Self {
            host,
            len,
            guest_pc: access.pc,
            access,
            live_regs: access.live_regs(),
            owner,
            state: SiteState::FastPath,
            trampoline: None,
        }
    }

    pub fn range(&self) -> HostRange {
        HostRange::new(self.host, self.host + self.len)
    }

    /// Host address right after the site
    pub fn resume_addr(&self) -> HostAddr {
        self.host + self.len
    }
}

/// Bytes one trampoline occupies
pub const TRAMPOLINE_SIZE: usize = size::REGS + size::MEM + size::REGS + size::JUMP;

/// All live sites, keyed by host address
#[derive(Debug, Default)]
pub struct BackpatchTable {
    sites: BTreeMap<HostAddr, BackpatchSite>,
    clear_requested: bool,
    patched: u64,
    inline_emulations: u64,
}

impl BackpatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn get(&self, host: HostAddr) -> Option<&BackpatchSite> {
        self.sites.get(&host)
    }

    /// Site whose bytes contain `addr`
    pub fn find_containing(&self, addr: HostAddr) -> Option<&BackpatchSite> {
        self.sites
            .range(..=addr)
            .next_back()
            .map(|(_, site)| site)
            .filter(|site| site.range().contains(addr))
    }

    fn find_containing_mut(&mut self, addr: HostAddr) -> Option<&mut BackpatchSite> {
        self.sites
            .range_mut(..=addr)
            .next_back()
            .map(|(_, site)| site)
            .filter(|site| site.range().contains(addr))
    }

    pub fn register(&mut self, site: BackpatchSite) -> Result<(), JitError> {
        if site.len < size::JUMP as u32 {
            return Err(JitError::CacheInvariantViolation(format!(
                "site at {:#x} is {} bytes, too small to patch",
                site.host, site.len
            )));
        }
        let overlaps = self.find_containing(site.host).is_some()
            || self
                .sites
                .range(site.host..site.resume_addr())
                .next()
                .is_some();
        if overlaps {
            return Err(JitError::CacheInvariantViolation(format!(
                "site at {:#x} overlaps an existing site",
                site.host
            )));
        }
        self.sites.insert(site.host, site);
        Ok(())
    }

    /// Drop the sites a block owned, releasing their trampolines
    pub fn remove_owned_by(
        &mut self,
        owner: BlockId,
        hosts: &[HostAddr],
        far: &mut CodeRegion,
    ) -> Result<usize, JitError> {
        let mut removed = 0;
        for host in hosts {
            if self.sites.get(host).is_some_and(|s| s.owner == owner) {
                if let Some(site) = self.sites.remove(host) {
                    if let Some(trampoline) = site.trampoline {
                        far.fill(trampoline, TRAP_FILL)?;
                        far.release(trampoline)?;
                    }
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Forget every site; trampolines go away with the far region reset
    pub fn clear(&mut self) {
        self.sites.clear();
        self.clear_requested = false;
    }

    pub fn clear_requested(&self) -> bool {
        self.clear_requested
    }

    pub fn request_clear(&mut self) {
        self.clear_requested = true;
    }

    pub fn patched(&self) -> u64 {
        self.patched
    }

    pub fn inline_emulations(&self) -> u64 {
        self.inline_emulations
    }
}

fn generate_trampoline(site: &BackpatchSite, far: &mut CodeRegion) -> Result<HostRange, JitError> {
    let reservation = far.allocate(TRAMPOLINE_SIZE)?;
    let mut emitter = Emitter::new(reservation.start(), reservation.capacity());
    emitter.save_regs(site.live_regs);
    emitter.mem_slow(&site.access);
    emitter.restore_regs(site.live_regs);
    emitter.jump(site.resume_addr());
    if emitter.has_write_failed() {
        far.abort(reservation)?;
        return Err(JitError::OutOfCodeSpace {
            requested: TRAMPOLINE_SIZE,
            largest_free: far.largest_free() as usize,
        });
    }
    let bytes = emitter.into_bytes();
    if let Err(e) = far.write(reservation.start(), &bytes) {
        far.abort(reservation)?;
        return Err(e);
    }
    far.commit(reservation, bytes.len())
}

fn patch_site(site: &BackpatchSite, target: HostAddr, code: &mut CodeSpace) -> Result<(), JitError> {
    let mut emitter = Emitter::new(site.host, site.len as usize);
    emitter.jump(target);
    emitter.trap_fill_to(site.len as usize);
    if emitter.has_write_failed() {
        return Err(JitError::BackpatchSiteMismatch { host: site.host });
    }
    code.write(site.host, emitter.bytes())
}

impl TrapHandler for BackpatchTable {
    fn handle_fault(&mut self, fault: &HostFault, context: &mut HostContext, code: &mut CodeSpace) -> TrapOutcome {
        let Some(site) = self.find_containing_mut(fault.host_pc) else {
            og_core::jit_debug!("Fault at host {:#x} is not a backpatch site", fault.host_pc);
            return TrapOutcome::NotHandled;
        };

        match site.state {
            SiteState::SlowPath => {
                // Already patched; the jump is in place
                match site.trampoline {
                    Some(trampoline) => {
                        context.pc = trampoline.start;
                        TrapOutcome::Resume
                    }
                    None => TrapOutcome::NotHandled,
                }
            }
            SiteState::Patching => {
                tracing::error!(target: "jit", "Re-entrant fault while patching site {:#x}", site.host);
                TrapOutcome::NotHandled
            }
            SiteState::FastPath => {
                site.state = SiteState::Patching;
                let trampoline = match site.trampoline {
                    Some(trampoline) => Ok(trampoline),
                    None => generate_trampoline(site, &mut code.far),
                };
                let patched = trampoline.and_then(|t| patch_site(site, t.start, code).map(|_| t));
                match patched {
                    Ok(trampoline) => {
                        site.trampoline = Some(trampoline);
                        site.state = SiteState::SlowPath;
                        context.pc = trampoline.start;
                        og_core::jit_debug!(
                            "Backpatched access at guest {:08x} (host {:#x}) to trampoline {:#x}",
                            site.guest_pc,
                            site.host,
                            trampoline.start
                        );
                        self.patched += 1;
                        TrapOutcome::Resume
                    }
                    Err(e) => {
                        site.state = SiteState::FastPath;
                        context.pc = site.resume_addr();
                        tracing::warn!(
                            target: "jit",
                            "Could not backpatch access at guest {:08x}: {}; emulating in place",
                            site.guest_pc,
                            e
                        );
                        self.inline_emulations += 1;
                        self.clear_requested = true;
                        TrapOutcome::EmulateInline
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{decode, HostOp};
    use og_ppu::MemAccess;

    /// Emit one fast load at the start of the near region
    fn setup(far_size: u32) -> (CodeSpace, BackpatchTable, BackpatchSite) {
        let mut code = CodeSpace::new(1024, far_size);
        // lwz r3, 0(r4)
        let access = MemAccess::from_opcode(0x8064_0000).unwrap();
        let args = MemArgs::new(&access, 0x8000_1000, 1);
        let mut emitter = Emitter::new(0, 64);
        emitter.mem_fast(&args);
        emitter.nop();
        code.write(0, emitter.bytes()).unwrap();

        let site = BackpatchSite::new(0, size::MEM as u32, args, BlockId(0));
        let mut table = BackpatchTable::new();
        table.register(site.clone()).unwrap();
        (code, table, site)
    }

    fn fault_at(host_pc: HostAddr) -> HostFault {
        HostFault {
            host_pc,
            guest_addr: 0x8000_2000,
            store: false,
        }
    }

    #[test]
    fn test_first_fault_patches_site() {
        let (mut code, mut table, site) = setup(256);
        let mut ctx = HostContext::new(0);
        let outcome = table.handle_fault(&fault_at(0), &mut ctx, &mut code);
        assert_eq!(outcome, TrapOutcome::Resume);

        let patched = table.get(0).unwrap();
        assert_eq!(patched.state, SiteState::SlowPath);
        let trampoline = patched.trampoline.unwrap();
        assert_eq!(ctx.pc, trampoline.start);
        assert_eq!(trampoline.len() as usize, TRAMPOLINE_SIZE);

        // Site now jumps to the trampoline, rest is trap filler
        let bytes = code.read(site.range()).unwrap();
        match decode(bytes).unwrap() {
            (HostOp::Jump(target), len) => {
                assert_eq!(target, trampoline.start);
                assert!(bytes[len..].iter().all(|&b| b == TRAP_FILL));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Trampoline: save, slow access, restore, jump back
        let tramp = code.read(trampoline).unwrap();
        let (op, len) = decode(tramp).unwrap();
        assert!(matches!(op, HostOp::SaveRegs(mask) if mask == site.live_regs));
        let tramp = &tramp[len..];
        let (op, len) = decode(tramp).unwrap();
        assert!(matches!(op, HostOp::MemSlow(_)));
        let tramp = &tramp[len..];
        let (op, len) = decode(tramp).unwrap();
        assert!(matches!(op, HostOp::RestoreRegs(_)));
        let (op, _) = decode(&tramp[len..]).unwrap();
        assert!(matches!(op, HostOp::Jump(addr) if addr == site.resume_addr()));
        assert_eq!(table.patched(), 1);
    }

    #[test]
    fn test_fault_inside_site_bytes_is_found() {
        let (mut code, mut table, _) = setup(256);
        let mut ctx = HostContext::new(3);
        assert_eq!(
            table.handle_fault(&fault_at(3), &mut ctx, &mut code),
            TrapOutcome::Resume
        );
    }

    #[test]
    fn test_unknown_address_not_handled() {
        let (mut code, mut table, site) = setup(256);
        let mut ctx = HostContext::new(site.resume_addr());
        let outcome = table.handle_fault(&fault_at(site.resume_addr()), &mut ctx, &mut code);
        assert_eq!(outcome, TrapOutcome::NotHandled);
        assert_eq!(table.get(0).unwrap().state, SiteState::FastPath);
    }

    #[test]
    fn test_full_far_region_emulates_inline() {
        let (mut code, mut table, site) = setup(16);
        let mut ctx = HostContext::new(0);
        let outcome = table.handle_fault(&fault_at(0), &mut ctx, &mut code);
        assert_eq!(outcome, TrapOutcome::EmulateInline);
        assert_eq!(ctx.pc, site.resume_addr());
        assert!(table.clear_requested());
        assert_eq!(table.get(0).unwrap().state, SiteState::FastPath);
        assert_eq!(table.inline_emulations(), 1);
    }

    #[test]
    fn test_remove_releases_trampoline() {
        let (mut code, mut table, _) = setup(256);
        let mut ctx = HostContext::new(0);
        table.handle_fault(&fault_at(0), &mut ctx, &mut code);
        assert!(code.far.largest_free() < 256);
        let removed = table.remove_owned_by(BlockId(0), &[0], &mut code.far).unwrap();
        assert_eq!(removed, 1);
        assert!(table.is_empty());
        assert_eq!(code.far.largest_free(), 256);
    }

    #[test]
    fn test_overlapping_registration_rejected() {
        let (_, mut table, site) = setup(256);
        let mut other = site.clone();
        other.host = 4;
        assert!(table.register(other).is_err());
        let mut tiny = site;
        tiny.host = 100;
        tiny.len = 2;
        assert!(table.register(tiny).is_err());
    }
}
