use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uchal_bp::PartialBuffer;
use uchal_core::{NvAddr, NvDevId, NvError, NvOpResult};

use crate::sem::Signal;

/// Result slot of an asynchronous write.
///
/// Holds `InProgress` from acceptance until the consumer has released the
/// staging buffer, then the final result. A fresh slot reads `Ok` and carries
/// no meaning until it has been passed to `write_async`.
#[derive(Clone, Debug)]
pub struct AsyncResult(Arc<AtomicU8>);

impl AsyncResult {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(NvOpResult::Ok.as_u8())))
    }

    pub fn status(&self) -> NvOpResult {
        NvOpResult::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(NvOpResult::BadRequest)
    }

    pub fn poll(&self) -> nb::Result<(), NvError> {
        self.status().into_nb()
    }

    /// Poll until done or `timeout` expires (`WouldBlock`).
    pub fn block(&self, timeout: Duration) -> nb::Result<(), NvError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll() {
                Err(nb::Error::WouldBlock) if Instant::now() < deadline => std::thread::yield_now(),
                other => return other,
            }
        }
    }

    pub(crate) fn set(&self, res: NvOpResult) {
        self.0.store(res.as_u8(), Ordering::Release);
    }
}

impl Default for AsyncResult {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued NV operation. The payload shape is fixed by the variant.
#[derive(Debug, Default)]
pub enum Request {
    #[default]
    NoOp,
    Read { dev: NvDevId, addr: NvAddr, dst: Vec<u8>, notify: Signal },
    SyncWrite { dev: NvDevId, addr: NvAddr, src: PartialBuffer, notify: Signal },
    AsyncWrite { dev: NvDevId, addr: NvAddr, src: PartialBuffer, result: AsyncResult },
    Erase { dev: NvDevId, notify: Signal },
    Flush { notify: Signal },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::NoOp => "nop",
            Request::Read { .. } => "read",
            Request::SyncWrite { .. } => "sync-write",
            Request::AsyncWrite { .. } => "async-write",
            Request::Erase { .. } => "erase",
            Request::Flush { .. } => "flush",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Request::Read { dst, .. } => dst.len(),
            Request::SyncWrite { src, .. } | Request::AsyncWrite { src, .. } => src.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Complete the request without touching any device.
    pub(crate) fn reject(self, err: NvError) {
        match self {
            Request::NoOp => {}
            Request::Read { dst, notify, .. } => notify.complete(err.into(), Some(dst)),
            Request::SyncWrite { src, notify, .. } => notify.complete(err.into(), src.into_standalone()),
            Request::AsyncWrite { src, result, .. } => {
                drop(src);
                result.set(err.into());
            }
            Request::Erase { notify, .. } | Request::Flush { notify } => notify.complete(err.into(), None),
        }
    }
}
