#![no_std]
#![forbid(unsafe_code)]

use uchal_core::{NvAddr, NvResult};

/// Addressable window and write granularity of one memory device.
///
/// INVARIANT: `start <= end` and `write_unit > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMap {
    start: NvAddr,
    end: NvAddr,
    write_unit: NvAddr,
}

impl AddressMap {
    pub const fn new(start: NvAddr, end: NvAddr, write_unit: NvAddr) -> Option<Self> {
        if start > end || write_unit == 0 {
            return None;
        }
        Some(Self { start, end, write_unit })
    }

    pub fn start(&self) -> NvAddr { self.start }
    pub fn end(&self) -> NvAddr { self.end }
    pub fn write_unit(&self) -> NvAddr { self.write_unit }

    /// True when `[addr, addr + size)` lies inside `[start, end]`.
    /// An empty range is never contained.
    pub fn contains(&self, addr: NvAddr, size: usize) -> bool {
        if size == 0 || addr < self.start {
            return false;
        }
        let Ok(size) = NvAddr::try_from(size) else { return false };
        match addr.checked_add(size - 1) {
            Some(last) => last <= self.end,
            None => false,
        }
    }

    /// Page containing `addr` and the page length.
    /// Pages are aligned on absolute multiples of the write unit.
    pub fn page_of(&self, addr: NvAddr) -> Option<(NvAddr, usize)> {
        if addr < self.start || addr > self.end {
            return None;
        }
        let page_addr = self.write_unit * (addr / self.write_unit);
        Some((page_addr, self.write_unit as usize))
    }
}

/// Physical operations of one memory device (chip, partition, emulated region).
///
/// These are the only calls that touch storage. The engine guarantees they are
/// never invoked concurrently for devices sharing one engine.
pub trait NvMemPeripheral: Send {
    fn init(&mut self) {}

    fn deinit(&mut self) {}

    /// Read `dst.len()` bytes starting at `addr`.
    fn read(&mut self, addr: NvAddr, dst: &mut [u8]) -> NvResult<()>;

    /// Program one whole write unit at the page-aligned `page_addr`.
    fn write(&mut self, page_addr: NvAddr, page: &[u8]) -> NvResult<()>;

    /// Erase the whole device.
    fn erase(&mut self) -> NvResult<()>;
}
