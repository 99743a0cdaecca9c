//! Memory-mapped I/O devices

use crate::pages::AccessSize;

/// A device answering guest accesses to a physical address window
pub trait MmioDevice: Send {
    /// Short device name for logs
    fn name(&self) -> &str;

    /// Read `size` bytes at `offset` into the device window
    fn read(&mut self, offset: u32, size: AccessSize) -> u64;

    /// Write `size` bytes at `offset` into the device window
    fn write(&mut self, offset: u32, size: AccessSize, value: u64);
}

/// A bank of plain 32-bit registers
///
/// Sub-word accesses address the big-endian bytes of the containing register.
pub struct RegisterBank {
    name: String,
    regs: Vec<u32>,
    reads: u64,
    writes: u64,
}

impl RegisterBank {
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            regs: vec![0; count],
            reads: 0,
            writes: 0,
        }
    }

    /// Create a bank with initial register values
    pub fn with_values(name: impl Into<String>, values: &[u32]) -> Self {
        let mut bank = Self::new(name, values.len());
        bank.regs.copy_from_slice(values);
        bank
    }

    /// Number of guest reads served
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Number of guest writes served
    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn byte(&self, offset: u32) -> u8 {
        let reg = (offset / 4) as usize;
        let shift = 24 - 8 * (offset % 4);
        self.regs.get(reg).map_or(0, |r| (r >> shift) as u8)
    }

    fn set_byte(&mut self, offset: u32, value: u8) {
        let reg = (offset / 4) as usize;
        let shift = 24 - 8 * (offset % 4);
        if let Some(r) = self.regs.get_mut(reg) {
            *r = (*r & !(0xFF << shift)) | ((value as u32) << shift);
        }
    }
}

impl MmioDevice for RegisterBank {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, offset: u32, size: AccessSize) -> u64 {
        self.reads += 1;
        (0..size.bytes()).fold(0u64, |acc, i| (acc << 8) | self.byte(offset + i) as u64)
    }

    fn write(&mut self, offset: u32, size: AccessSize, value: u64) {
        self.writes += 1;
        let len = size.bytes();
        for i in 0..len {
            self.set_byte(offset + i, (value >> (8 * (len - 1 - i))) as u8);
        }
    }
}
