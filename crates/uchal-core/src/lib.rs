#![no_std]
#[cfg(feature = "std")]
extern crate std;

/// Address inside an NV memory device.
pub type NvAddr = u32;

/// Index of a memory device inside its engine.
pub type NvDevId = u32;

/// Alignment applied to every buffer pool chunk size.
pub const BP_MEM_ALIGN: usize = 4;

/// Default bounded wait for every NV semaphore take (milliseconds).
pub const NV_MAX_DELAY_MS: u64 = 1000;

/// Flat result of an NV operation.
///
/// This is the value stored in result slots and reported by polling handles.
/// `Ok` and `InProgress` are the only non-failure states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NvOpResult {
    Ok = 0,
    InProgress = 1,
    BadRequest = 2,
    NoSemAvailable = 3,
    NoBufferAvailable = 4,
    TooManyRequests = 5,
    DeviceReadError = 6,
    DeviceWriteError = 7,
    DeviceEraseError = 8,
    Locked = 9,
}

impl NvOpResult {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let res = match value {
            0 => NvOpResult::Ok,
            1 => NvOpResult::InProgress,
            2 => NvOpResult::BadRequest,
            3 => NvOpResult::NoSemAvailable,
            4 => NvOpResult::NoBufferAvailable,
            5 => NvOpResult::TooManyRequests,
            6 => NvOpResult::DeviceReadError,
            7 => NvOpResult::DeviceWriteError,
            8 => NvOpResult::DeviceEraseError,
            9 => NvOpResult::Locked,
            _ => return None,
        };
        Some(res)
    }

    /// `Ok` -> `Ok(())`, `InProgress` -> `WouldBlock`, everything else is an error.
    pub fn into_nb(self) -> nb::Result<(), NvError> {
        match self {
            NvOpResult::Ok => Ok(()),
            NvOpResult::InProgress => Err(nb::Error::WouldBlock),
            other => Err(nb::Error::Other(NvError::from_result(other).unwrap_or(NvError::BadRequest))),
        }
    }

    pub fn is_done(self) -> bool {
        self != NvOpResult::InProgress
    }
}

impl From<NvError> for NvOpResult {
    fn from(err: NvError) -> Self {
        match err {
            NvError::BadRequest => NvOpResult::BadRequest,
            NvError::NoSemAvailable => NvOpResult::NoSemAvailable,
            NvError::NoBufferAvailable => NvOpResult::NoBufferAvailable,
            NvError::TooManyRequests => NvOpResult::TooManyRequests,
            NvError::DeviceReadError => NvOpResult::DeviceReadError,
            NvError::DeviceWriteError => NvOpResult::DeviceWriteError,
            NvError::DeviceEraseError => NvOpResult::DeviceEraseError,
            NvError::Locked => NvOpResult::Locked,
        }
    }
}

impl From<NvResult<()>> for NvOpResult {
    fn from(res: NvResult<()>) -> Self {
        match res {
            Ok(()) => NvOpResult::Ok,
            Err(e) => e.into(),
        }
    }
}

pub type NvResult<T> = Result<T, NvError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NvError {
    /// Bad arguments, address out of range or engine not initialized.
    BadRequest,
    NoSemAvailable,
    NoBufferAvailable,
    /// Request queue is full.
    TooManyRequests,
    DeviceReadError,
    DeviceWriteError,
    DeviceEraseError,
    Locked,
}

impl NvError {
    /// Failure part of a flat result. `None` for `Ok` and `InProgress`.
    pub fn from_result(res: NvOpResult) -> Option<Self> {
        match res {
            NvOpResult::Ok | NvOpResult::InProgress => None,
            NvOpResult::BadRequest => Some(NvError::BadRequest),
            NvOpResult::NoSemAvailable => Some(NvError::NoSemAvailable),
            NvOpResult::NoBufferAvailable => Some(NvError::NoBufferAvailable),
            NvOpResult::TooManyRequests => Some(NvError::TooManyRequests),
            NvOpResult::DeviceReadError => Some(NvError::DeviceReadError),
            NvOpResult::DeviceWriteError => Some(NvError::DeviceWriteError),
            NvOpResult::DeviceEraseError => Some(NvError::DeviceEraseError),
            NvOpResult::Locked => Some(NvError::Locked),
        }
    }
}

impl core::fmt::Display for NvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl core::fmt::Display for NvOpResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NvError {}
