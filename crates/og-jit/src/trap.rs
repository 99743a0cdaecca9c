//! Host fault delivery
//!
//! A fast-path access that the fastmem view cannot serve raises a host fault.
//! The [`TrapDispatcher`] stands in for the process fault hook: while installed
//! it forwards each fault to a [`TrapHandler`], which either resumes execution
//! at a new host address or declines, in which case the fault belongs to the
//! guest.

use crate::code_region::{CodeSpace, HostAddr};

/// A faulting host access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFault {
    /// Host address of the faulting op
    pub host_pc: HostAddr,
    /// Guest effective address being accessed
    pub guest_addr: u32,
    pub store: bool,
}

/// Host register context at the fault, editable by the handler
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    /// Where execution resumes
    pub pc: HostAddr,
    /// Register masks pushed by trampolines
    pub saved: Vec<u64>,
}

impl HostContext {
    pub fn new(pc: HostAddr) -> Self {
        Self { pc, saved: Vec::new() }
    }
}

/// What the handler did with a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Continue at `context.pc`
    Resume,
    /// The faulting access must be completed by the caller through the slow
    /// path, then execution continues at `context.pc`
    EmulateInline,
    /// Not a recorded site; deliver the fault to the guest
    NotHandled,
}

/// Receives host faults
pub trait TrapHandler {
    fn handle_fault(&mut self, fault: &HostFault, context: &mut HostContext, code: &mut CodeSpace) -> TrapOutcome;
}

/// Fault hook registration and counters
#[derive(Debug, Default)]
pub struct TrapDispatcher {
    installed: bool,
    faults: u64,
    handled: u64,
}

impl TrapDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self) {
        if !self.installed {
            og_core::jit_debug!("Fault handler installed");
        }
        self.installed = true;
    }

    pub fn uninstall(&mut self) {
        if self.installed {
            og_core::jit_debug!("Fault handler removed");
        }
        self.installed = false;
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Host faults seen
    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Host faults a handler claimed
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Deliver a fault
    pub fn dispatch(
        &mut self,
        fault: &HostFault,
        context: &mut HostContext,
        handler: &mut dyn TrapHandler,
        code: &mut CodeSpace,
    ) -> TrapOutcome {
        self.faults += 1;
        if !self.installed {
            return TrapOutcome::NotHandled;
        }
        let outcome = handler.handle_fault(fault, context, code);
        if outcome != TrapOutcome::NotHandled {
            self.handled += 1;
        }
        og_core::jit_trace!(
            "Host fault at {:#x} (guest {:08x}, store={}): {:?}",
            fault.host_pc,
            fault.guest_addr,
            fault.store,
            outcome
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Redirect(HostAddr);

    impl TrapHandler for Redirect {
        fn handle_fault(&mut self, _: &HostFault, context: &mut HostContext, _: &mut CodeSpace) -> TrapOutcome {
            context.pc = self.0;
            TrapOutcome::Resume
        }
    }

    fn fault() -> HostFault {
        HostFault {
            host_pc: 0x10,
            guest_addr: 0x8000_2000,
            store: false,
        }
    }

    #[test]
    fn test_uninstalled_declines() {
        let mut traps = TrapDispatcher::new();
        let mut code = CodeSpace::new(64, 64);
        let mut ctx = HostContext::new(0x10);
        let outcome = traps.dispatch(&fault(), &mut ctx, &mut Redirect(0x40), &mut code);
        assert_eq!(outcome, TrapOutcome::NotHandled);
        assert_eq!(ctx.pc, 0x10);
        assert_eq!(traps.faults(), 1);
        assert_eq!(traps.handled(), 0);
    }

    #[test]
    fn test_installed_forwards() {
        let mut traps = TrapDispatcher::new();
        traps.install();
        let mut code = CodeSpace::new(64, 64);
        let mut ctx = HostContext::new(0x10);
        let outcome = traps.dispatch(&fault(), &mut ctx, &mut Redirect(0x40), &mut code);
        assert_eq!(outcome, TrapOutcome::Resume);
        assert_eq!(ctx.pc, 0x40);
        assert_eq!(traps.handled(), 1);
    }
}
