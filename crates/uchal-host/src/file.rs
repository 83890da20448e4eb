use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, error, info};
use uchal_core::{NvAddr, NvError, NvResult};
use uchal_hal::{AddressMap, NvMemPeripheral};

use crate::ERASED;

const FILL_BLOCK: usize = 4096;

/// Device backed by a file image. Every page write is synced before it
/// reports success.
pub struct FileDevice {
    file: File,
    path: PathBuf,
    base: NvAddr,
    size: u64,
}

impl FileDevice {
    /// Open or create the image and grow it to `size` bytes. Bytes added by
    /// growing read as erased.
    pub fn open(path: impl AsRef<Path>, base: NvAddr, size: u64) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open image {}", path.display()))?;

        let current = file.metadata()?.len();
        if current < size {
            file.seek(SeekFrom::Start(current))?;
            fill_erased(&mut file, size - current)?;
            file.sync_all()?;
            info!("nv: image {} grown {} -> {} bytes", path.display(), current, size);
        }
        Ok(Self { file, path, base, size })
    }

    pub fn address_map(&self, write_unit: NvAddr) -> Option<AddressMap> {
        let last = NvAddr::try_from(self.size).ok()?.checked_sub(1)?;
        AddressMap::new(self.base, self.base.checked_add(last)?, write_unit)
    }

    pub fn path(&self) -> &Path { &self.path }

    fn seek_to(&mut self, addr: NvAddr) -> io::Result<()> {
        let offset = addr.checked_sub(self.base).ok_or(io::ErrorKind::InvalidInput)?;
        self.file.seek(SeekFrom::Start(u64::from(offset)))?;
        Ok(())
    }

    fn fail(&self, op: &str, e: io::Error, err: NvError) -> NvError {
        error!("nv: {} {} failed: {}", self.path.display(), op, e);
        err
    }
}

fn fill_erased(file: &mut File, mut len: u64) -> io::Result<()> {
    let block = [ERASED; FILL_BLOCK];
    while len > 0 {
        let n = len.min(FILL_BLOCK as u64) as usize;
        file.write_all(&block[..n])?;
        len -= n as u64;
    }
    Ok(())
}

impl NvMemPeripheral for FileDevice {
    fn deinit(&mut self) {
        if let Err(e) = self.file.sync_all() {
            error!("nv: {} final sync failed: {}", self.path.display(), e);
        }
        debug!("nv: {} closed", self.path.display());
    }

    fn read(&mut self, addr: NvAddr, dst: &mut [u8]) -> NvResult<()> {
        self.seek_to(addr)
            .and_then(|_| self.file.read_exact(dst))
            .map_err(|e| self.fail("read", e, NvError::DeviceReadError))
    }

    fn write(&mut self, page_addr: NvAddr, page: &[u8]) -> NvResult<()> {
        self.seek_to(page_addr)
            .and_then(|_| self.file.write_all(page))
            .and_then(|_| self.file.sync_all())
            .map_err(|e| self.fail("write", e, NvError::DeviceWriteError))
    }

    fn erase(&mut self) -> NvResult<()> {
        let size = self.size;
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| fill_erased(&mut self.file, size))
            .and_then(|_| self.file.sync_all())
            .map_err(|e| self.fail("erase", e, NvError::DeviceEraseError))
    }
}
