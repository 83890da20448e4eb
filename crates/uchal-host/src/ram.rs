use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex;
use uchal_core::{NvAddr, NvError, NvResult};
use uchal_hal::{AddressMap, NvMemPeripheral};

use crate::ERASED;

/// Shared contents of an emulated device.
#[derive(Clone)]
pub struct RamImage(Arc<Mutex<Vec<u8>>>);

impl RamImage {
    pub fn new(size: usize, fill: u8) -> Self {
        Self(Arc::new(Mutex::new(vec![fill; size])))
    }

    pub fn len(&self) -> usize { self.0.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn fill(&self, value: u8) {
        self.0.lock().fill(value);
    }

    /// Overwrite bytes at `offset`, bypassing the engine. Returns false when out of bounds.
    pub fn poke(&self, offset: usize, data: &[u8]) -> bool {
        let mut cells = self.0.lock();
        match cells.get_mut(offset..offset + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Read { addr: NvAddr, len: usize },
    Write { addr: NvAddr, len: usize },
    Erase,
}

#[derive(Default)]
struct Faults {
    reads: AtomicBool,
    writes: AtomicBool,
    erase: AtomicBool,
}

/// In-memory device. Clones share the image, trace and fault switches, so a
/// clone kept outside the engine observes and steers the one inside it.
#[derive(Clone)]
pub struct RamDevice {
    base: NvAddr,
    image: RamImage,
    trace: Arc<Mutex<Vec<DeviceOp>>>,
    faults: Arc<Faults>,
}

impl RamDevice {
    /// `size` erased bytes mapped at `base`.
    pub fn new(base: NvAddr, size: usize) -> Self {
        Self::with_image(base, RamImage::new(size, ERASED))
    }

    pub fn with_image(base: NvAddr, image: RamImage) -> Self {
        Self { base, image, trace: Arc::default(), faults: Arc::default() }
    }

    /// Window covering the whole image.
    pub fn address_map(&self, write_unit: NvAddr) -> Option<AddressMap> {
        let len = NvAddr::try_from(self.image.len()).ok()?.checked_sub(1)?;
        AddressMap::new(self.base, self.base.checked_add(len)?, write_unit)
    }

    pub fn image(&self) -> &RamImage { &self.image }

    pub fn trace(&self) -> Vec<DeviceOp> {
        self.trace.lock().clone()
    }

    pub fn clear_trace(&self) {
        self.trace.lock().clear();
    }

    pub fn fail_reads(&self, on: bool) {
        self.faults.reads.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.faults.writes.store(on, Ordering::SeqCst);
    }

    pub fn fail_erase(&self, on: bool) {
        self.faults.erase.store(on, Ordering::SeqCst);
    }

    fn offset(&self, addr: NvAddr) -> Option<usize> {
        addr.checked_sub(self.base).map(|o| o as usize)
    }
}

impl NvMemPeripheral for RamDevice {
    fn read(&mut self, addr: NvAddr, dst: &mut [u8]) -> NvResult<()> {
        self.trace.lock().push(DeviceOp::Read { addr, len: dst.len() });
        if self.faults.reads.load(Ordering::SeqCst) {
            return Err(NvError::DeviceReadError);
        }
        let start = self.offset(addr).ok_or(NvError::DeviceReadError)?;
        let cells = self.image.0.lock();
        let src = cells.get(start..start + dst.len()).ok_or(NvError::DeviceReadError)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, page_addr: NvAddr, page: &[u8]) -> NvResult<()> {
        self.trace.lock().push(DeviceOp::Write { addr: page_addr, len: page.len() });
        if self.faults.writes.load(Ordering::SeqCst) {
            return Err(NvError::DeviceWriteError);
        }
        let start = self.offset(page_addr).ok_or(NvError::DeviceWriteError)?;
        let mut cells = self.image.0.lock();
        let dst = cells.get_mut(start..start + page.len()).ok_or(NvError::DeviceWriteError)?;
        dst.copy_from_slice(page);
        Ok(())
    }

    fn erase(&mut self) -> NvResult<()> {
        self.trace.lock().push(DeviceOp::Erase);
        if self.faults.erase.load(Ordering::SeqCst) {
            return Err(NvError::DeviceEraseError);
        }
        self.image.fill(ERASED);
        Ok(())
    }
}
