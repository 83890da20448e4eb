//! Host platform for the NV engine: emulated and file-backed memory devices,
//! plus the dedicated consumer thread.

mod file;
mod ram;
mod worker;

pub use file::FileDevice;
pub use ram::{DeviceOp, RamDevice, RamImage};
pub use worker::Worker;

/// Value of an erased cell.
pub const ERASED: u8 = 0xFF;
