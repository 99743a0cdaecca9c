//! Guest CPU state

use bitflags::bitflags;
use og_memory::AddressSpace;

use crate::exceptions::ExceptionFlags;

bitflags! {
    /// Machine State Register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Msr: u32 {
        /// Little-endian mode
        const LE  = 1 << 0;
        /// Recoverable interrupt
        const RI  = 1 << 1;
        /// Data address translation
        const DR  = 1 << 4;
        /// Instruction address translation
        const IR  = 1 << 5;
        /// Exception prefix (vectors at 0xFFF0_0000)
        const IP  = 1 << 6;
        /// Floating-point exception mode 1
        const FE1 = 1 << 8;
        /// Branch trace enable
        const BE  = 1 << 9;
        /// Single-step trace enable
        const SE  = 1 << 10;
        /// Floating-point exception mode 0
        const FE0 = 1 << 11;
        /// Machine check enable
        const ME  = 1 << 12;
        /// Floating-point available
        const FP  = 1 << 13;
        /// Problem state
        const PR  = 1 << 14;
        /// External interrupt enable
        const EE  = 1 << 15;
        /// Interrupt little-endian mode
        const ILE = 1 << 16;
        /// Power management enable
        const POW = 1 << 18;
    }
}

/// Whether the core should keep executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Running,
    /// Stopped on a breakpoint or by request
    Halted,
}

/// Special purpose register numbers
pub mod spr {
    pub const XER: usize = 1;
    pub const LR: usize = 8;
    pub const CTR: usize = 9;
    pub const DSISR: usize = 18;
    pub const DAR: usize = 19;
    pub const DEC: usize = 22;
    pub const SRR0: usize = 26;
    pub const SRR1: usize = 27;
    pub const SPRG0: usize = 272;
    pub const HID0: usize = 1008;
}

/// Register file and execution bookkeeping of the Gekko core
#[derive(Debug, Clone, PartialEq)]
pub struct PpuState {
    /// General purpose registers
    pub gpr: [u32; 32],
    /// Floating point registers (paired-single slot 0)
    pub fpr: [f64; 32],
    /// Condition register
    pub cr: u32,
    pub lr: u32,
    pub ctr: u32,
    pub xer: u32,
    pub msr: Msr,
    pub srr0: u32,
    pub srr1: u32,
    pub dar: u32,
    pub dsisr: u32,
    /// Remaining special purpose registers, indexed by SPR number
    pub spr: Box<[u32; 1024]>,
    /// Address of the next instruction to execute
    pub pc: u32,
    /// Remaining cycles in the current timing slice
    pub downcount: i64,
    /// Raised but not yet delivered exceptions
    pub exceptions: ExceptionFlags,
    pub run_state: RunState,
}

impl Default for PpuState {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            fpr: [0.0; 32],
            cr: 0,
            lr: 0,
            ctr: 0,
            xer: 0,
            msr: Msr::empty(),
            srr0: 0,
            srr1: 0,
            dar: 0,
            dsisr: 0,
            spr: Box::new([0; 1024]),
            pc: 0,
            downcount: 0,
            exceptions: ExceptionFlags::empty(),
            run_state: RunState::Running,
        }
    }
}

impl PpuState {
    /// Create a state starting execution at `pc`
    pub fn new(pc: u32) -> Self {
        Self {
            pc,
            ..Self::default()
        }
    }

    /// Address space used for instruction fetches
    #[inline]
    pub fn instruction_space(&self) -> AddressSpace {
        if self.msr.contains(Msr::IR) {
            AddressSpace::Logical
        } else {
            AddressSpace::Physical
        }
    }

    /// Address space used for loads and stores
    #[inline]
    pub fn data_space(&self) -> AddressSpace {
        if self.msr.contains(Msr::DR) {
            AddressSpace::Logical
        } else {
            AddressSpace::Physical
        }
    }

    /// Translation-mode bits that select which set of translated blocks applies
    #[inline]
    pub fn feature_flags(&self) -> u32 {
        (self.msr.bits() >> 4) & 3
    }

    pub fn is_running(&self) -> bool {
        self.run_state == RunState::Running
    }

    /// Get CR field value (0-7)
    pub fn cr_field(&self, field: usize) -> u32 {
        (self.cr >> (28 - field * 4)) & 0xF
    }

    /// Set CR field value (0-7)
    pub fn set_cr_field(&mut self, field: usize, value: u32) {
        let shift = 28 - field * 4;
        self.cr = (self.cr & !(0xF << shift)) | ((value & 0xF) << shift);
    }

    /// Get a single CR bit (0 = most significant)
    pub fn cr_bit(&self, bit: u32) -> bool {
        (self.cr >> (31 - bit)) & 1 != 0
    }

    pub fn set_cr_bit(&mut self, bit: u32, value: bool) {
        let mask = 1 << (31 - bit);
        if value {
            self.cr |= mask;
        } else {
            self.cr &= !mask;
        }
    }

    /// Get XER CA (Carry) bit
    pub fn xer_ca(&self) -> bool {
        (self.xer & 0x2000_0000) != 0
    }

    /// Set XER CA (Carry) bit
    pub fn set_xer_ca(&mut self, value: bool) {
        if value {
            self.xer |= 0x2000_0000;
        } else {
            self.xer &= !0x2000_0000;
        }
    }

    /// Get XER SO (Summary Overflow) bit
    pub fn xer_so(&self) -> bool {
        (self.xer & 0x8000_0000) != 0
    }

    /// Set XER OV, accumulating into SO
    pub fn set_xer_ov(&mut self, value: bool) {
        if value {
            self.xer |= 0xC000_0000;
        } else {
            self.xer &= !0x4000_0000;
        }
    }

    /// Read a special purpose register
    pub fn mfspr(&self, n: usize) -> u32 {
        match n {
            spr::XER => self.xer,
            spr::LR => self.lr,
            spr::CTR => self.ctr,
            spr::DSISR => self.dsisr,
            spr::DAR => self.dar,
            spr::SRR0 => self.srr0,
            spr::SRR1 => self.srr1,
            _ => self.spr[n & 0x3FF],
        }
    }

    /// Write a special purpose register
    pub fn mtspr(&mut self, n: usize, value: u32) {
        match n {
            spr::XER => self.xer = value,
            spr::LR => self.lr = value,
            spr::CTR => self.ctr = value,
            spr::DSISR => self.dsisr = value,
            spr::DAR => self.dar = value,
            spr::SRR0 => self.srr0 = value,
            spr::SRR1 => self.srr1 = value,
            _ => self.spr[n & 0x3FF] = value,
        }
    }

    /// Compare guest-visible registers, ignoring scheduling bookkeeping
    pub fn same_registers(&self, other: &PpuState) -> bool {
        self.gpr == other.gpr
            && self
                .fpr
                .iter()
                .zip(other.fpr.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
            && self.cr == other.cr
            && self.lr == other.lr
            && self.ctr == other.ctr
            && self.xer == other.xer
            && self.msr == other.msr
            && self.srr0 == other.srr0
            && self.srr1 == other.srr1
            && self.dar == other.dar
            && self.pc == other.pc
    }
}
