//! Page-aligned read-modify-write.

use core::cmp::min;

use log::trace;
use uchal_bp::PartialBuffer;
use uchal_core::{NvAddr, NvError, NvResult};
use uchal_hal::{AddressMap, NvMemPeripheral};

/// Byte source for a page write: a chained buffer or plain caller memory.
pub trait PageSource {
    fn source_len(&self) -> usize;

    /// Copy `dst.len()` bytes starting at `offset`. Returns bytes copied.
    fn copy_out(&self, dst: &mut [u8], offset: usize) -> usize;
}

impl PageSource for PartialBuffer {
    fn source_len(&self) -> usize {
        self.len()
    }

    fn copy_out(&self, dst: &mut [u8], offset: usize) -> usize {
        self.copy_to_mem(dst, offset)
    }
}

impl PageSource for [u8] {
    fn source_len(&self) -> usize {
        self.len()
    }

    fn copy_out(&self, dst: &mut [u8], offset: usize) -> usize {
        let Some(src) = self.get(offset..) else { return 0 };
        let n = min(dst.len(), src.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }
}

/// Write `src` at `addr`, one whole write unit at a time.
///
/// A page the range does not cover entirely is read into `scratch` first so
/// the bytes outside `[addr, addr + len)` are written back unchanged. The
/// first failing device call aborts the remaining pages.
pub fn write_pages<S: PageSource + ?Sized>(
    dev: &mut dyn NvMemPeripheral,
    map: &AddressMap,
    scratch: &mut [u8],
    addr: NvAddr,
    src: &S,
) -> NvResult<()> {
    let mut addr = addr;
    let mut offset = 0;
    let mut remaining = src.source_len();

    while remaining > 0 {
        let (page_addr, unit) = map.page_of(addr).ok_or(NvError::BadRequest)?;
        let page = scratch.get_mut(..unit).ok_or(NvError::BadRequest)?;
        let in_page = (addr - page_addr) as usize;
        let chunk = min(unit - in_page, remaining);

        if in_page != 0 || chunk < unit {
            trace!("nv: rmw page {:#x}", page_addr);
            dev.read(page_addr, page)?;
        }
        src.copy_out(&mut page[in_page..in_page + chunk], offset);
        dev.write(page_addr, page)?;

        offset += chunk;
        remaining -= chunk;
        addr = addr.saturating_add(chunk as NvAddr);
    }
    Ok(())
}
