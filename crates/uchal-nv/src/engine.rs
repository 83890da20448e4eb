use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use log::{debug, error, info, warn};
use uchal_bp::{BufferPool, PartialBuffer};
use uchal_core::{NvAddr, NvDevId, NvError, NvOpResult, NvResult};
use uchal_hal::{AddressMap, NvMemPeripheral};

use crate::config::{EngineConfig, ProcessingMode};
use crate::page::write_pages;
use crate::queue::RequestQueue;
use crate::request::{AsyncResult, Request};
use crate::sem::{Completion, CountingSemaphore, PooledSemaphore, SemaphorePool};

/// Setup descriptor of one memory device.
pub struct NvMemory {
    map: AddressMap,
    ops: Box<dyn NvMemPeripheral>,
}

impl NvMemory {
    pub fn new<P: NvMemPeripheral + 'static>(map: AddressMap, ops: P) -> Self {
        Self { map, ops: Box::new(ops) }
    }

    pub fn from_boxed(map: AddressMap, ops: Box<dyn NvMemPeripheral>) -> Self {
        Self { map, ops }
    }
}

struct Physical {
    devices: Vec<Box<dyn NvMemPeripheral>>,
    page_buffer: Vec<u8>,
}

impl Physical {
    fn execute(&mut self, maps: &[AddressMap], req: Request) {
        let Physical { devices, page_buffer } = self;
        match req {
            Request::NoOp => {}
            Request::Read { dev, addr, mut dst, notify } => {
                let res = match devices.get_mut(dev as usize) {
                    Some(ops) => ops.read(addr, &mut dst),
                    None => Err(NvError::BadRequest),
                };
                log_device_error("read", dev, res);
                notify.complete(res.into(), Some(dst));
            }
            Request::SyncWrite { dev, addr, src, notify } => {
                let res = write_on(devices, maps, page_buffer, dev, addr, &src);
                log_device_error("write", dev, res);
                notify.complete(res.into(), src.into_standalone());
            }
            Request::AsyncWrite { dev, addr, src, result } => {
                let res = write_on(devices, maps, page_buffer, dev, addr, &src);
                log_device_error("write", dev, res);
                // Release first: a caller that sees the result may reuse the pool.
                src.release();
                result.set(res.into());
            }
            Request::Erase { dev, notify } => {
                let res = match devices.get_mut(dev as usize) {
                    Some(ops) => ops.erase(),
                    None => Err(NvError::BadRequest),
                };
                log_device_error("erase", dev, res);
                notify.complete(res.into(), None);
            }
            Request::Flush { notify } => notify.complete(NvOpResult::Ok, None),
        }
    }
}

fn write_on<S: crate::page::PageSource + ?Sized>(
    devices: &mut [Box<dyn NvMemPeripheral>],
    maps: &[AddressMap],
    page_buffer: &mut [u8],
    dev: NvDevId,
    addr: NvAddr,
    src: &S,
) -> NvResult<()> {
    let idx = dev as usize;
    match (devices.get_mut(idx), maps.get(idx)) {
        (Some(ops), Some(map)) => write_pages(&mut **ops, map, page_buffer, addr, src),
        _ => Err(NvError::BadRequest),
    }
}

fn log_device_error(op: &str, dev: NvDevId, res: NvResult<()>) {
    if let Err(e) = res {
        error!("nv: dev {} {} failed: {}", dev, op, e);
    }
}

fn into_result(res: NvOpResult) -> NvResult<()> {
    match NvError::from_result(res) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Arbitration unit for every memory device behind one shared resource.
///
/// Any number of threads may call the public operations; exactly one thread
/// runs [`NvEngine::process_requests`].
pub struct NvEngine {
    maps: Vec<AddressMap>,
    // Consumer role: whoever holds this is the only one touching devices.
    physical: Mutex<Physical>,
    requests: RequestQueue,
    semaphores: SemaphorePool,
    buf_pool: Arc<BufferPool>,
    idle: Option<CountingSemaphore>,
    config: EngineConfig,
    initialized: AtomicBool,
    lock: AtomicBool,
    op_in_progress: AtomicBool,
}

impl NvEngine {
    /// Set up the engine. Must run before any worker or producer thread starts.
    pub fn init(
        devices: Vec<NvMemory>,
        page_buffer: Vec<u8>,
        config: EngineConfig,
        buf_pool: Arc<BufferPool>,
    ) -> NvResult<Arc<Self>> {
        if devices.is_empty() || NvDevId::try_from(devices.len()).is_err() {
            return Err(NvError::BadRequest);
        }
        let largest_unit = devices.iter().map(|d| d.map.write_unit() as usize).max().unwrap_or(0);
        if page_buffer.len() < largest_unit {
            warn!("nv: page buffer {} < write unit {}", page_buffer.len(), largest_unit);
            return Err(NvError::BadRequest);
        }
        let requests = RequestQueue::create(config.queue_capacity).ok_or(NvError::BadRequest)?;
        let semaphores = SemaphorePool::create(config.sem_pool_size).ok_or(NvError::BadRequest)?;
        let idle = config.idle_wait.then(|| CountingSemaphore::new(0, config.queue_capacity));

        let mut maps = Vec::with_capacity(devices.len());
        let mut ops = Vec::with_capacity(devices.len());
        for NvMemory { map, ops: mut dev } in devices {
            dev.init();
            maps.push(map);
            ops.push(dev);
        }

        info!(
            "nv: engine up: {} device(s), queue {}, {} semaphore(s), {:?} mode",
            maps.len(),
            config.queue_capacity,
            config.sem_pool_size,
            config.mode
        );

        Ok(Arc::new(Self {
            maps,
            physical: Mutex::new(Physical { devices: ops, page_buffer }),
            requests,
            semaphores,
            buf_pool,
            idle,
            config,
            initialized: AtomicBool::new(true),
            lock: AtomicBool::new(false),
            op_in_progress: AtomicBool::new(false),
        }))
    }

    /// Drain, deinitialize every device and refuse all further work.
    pub fn deinit(&self) {
        if !self.is_initialized() {
            return;
        }
        loop {
            match self.lock(true) {
                Err(nb::Error::WouldBlock) => std::thread::yield_now(),
                _ => break,
            }
        }

        let mut phys = self.physical();
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        for dev in phys.devices.iter_mut() {
            dev.deinit();
        }
        // Producers that passed the lock check just before it was set.
        let mut stragglers = 0;
        while let Some(req) = self.requests.pop() {
            req.reject(NvError::BadRequest);
            stragglers += 1;
        }
        drop(phys);

        if stragglers > 0 {
            warn!("nv: {} request(s) rejected at deinit", stragglers);
        }
        info!("nv: engine down");
    }

    /// Reject new work. With `flush`, also drain the queue on this thread;
    /// `WouldBlock` means a physical operation is mid-flight, retry.
    pub fn lock(&self, flush: bool) -> nb::Result<(), NvError> {
        self.lock.store(true, Ordering::SeqCst);
        if !flush {
            return Ok(());
        }

        let mut phys = match self.physical.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(nb::Error::WouldBlock),
        };
        self.op_in_progress.store(true, Ordering::SeqCst);
        let mut drained = 0;
        while let Some(req) = self.requests.pop() {
            phys.execute(&self.maps, req);
            drained += 1;
        }
        self.op_in_progress.store(false, Ordering::SeqCst);

        if drained > 0 {
            debug!("nv: lock drained {} request(s)", drained);
        }
        Ok(())
    }

    pub fn unlock(&self) {
        if self.is_initialized() {
            self.lock.store(false, Ordering::SeqCst);
        }
    }

    /// Run one queued request. Returns true if one was processed.
    ///
    /// Call from exactly one dedicated thread per engine.
    pub fn process_requests(&self) -> bool {
        if self.config.mode == ProcessingMode::Inline || !self.is_initialized() || self.is_locked() {
            return false;
        }
        // A timed-out idle wait still looks at the queue: tokens and pending
        // requests can drift apart after a lock.
        let woke = self.idle.as_ref().is_some_and(|idle| idle.wait(self.config.max_wait));

        let mut phys = self.physical();
        // Lock or deinit may have won the race for the consumer role.
        if self.is_locked() || !self.is_initialized() {
            if let (true, Some(idle)) = (woke, &self.idle) {
                idle.post();
            }
            return false;
        }
        let Some(req) = self.requests.pop() else { return false };

        debug!("nv: processing {} ({} bytes)", req.name(), req.len());
        self.op_in_progress.store(true, Ordering::SeqCst);
        phys.execute(&self.maps, req);
        self.op_in_progress.store(false, Ordering::SeqCst);
        true
    }

    pub fn read_sync(&self, dev: NvDevId, addr: NvAddr, dst: &mut [u8]) -> NvResult<()> {
        self.check_range(dev, addr, dst.len())?;
        self.check_unlocked("read")?;

        if self.config.mode == ProcessingMode::Inline {
            return self.run_inline(|phys| match phys.devices.get_mut(dev as usize) {
                Some(ops) => ops.read(addr, dst),
                None => Err(NvError::BadRequest),
            });
        }

        // The consumer fills the semaphore's staging memory, which is copied
        // into `dst` here; caller memory never crosses threads.
        let sem = self.acquire_sem()?;
        let req = Request::Read { dev, addr, dst: sem.take_staging(dst.len()), notify: sem.notifier() };
        self.submit(req)?;

        let done = self.wait_done(&sem);
        if let Some(mem) = done.payload {
            if done.result == NvOpResult::Ok {
                dst.copy_from_slice(&mem[..dst.len()]);
            }
            sem.restore_staging(mem);
        }
        into_result(done.result)
    }

    pub fn write_sync(&self, dev: NvDevId, addr: NvAddr, src: &[u8]) -> NvResult<()> {
        self.check_range(dev, addr, src.len())?;
        self.check_unlocked("write")?;

        if self.config.mode == ProcessingMode::Inline {
            return self.run_inline(|phys| {
                let Physical { devices, page_buffer } = phys;
                write_on(devices, &self.maps, page_buffer, dev, addr, src)
            });
        }

        let sem = self.acquire_sem()?;
        let mut staging = sem.take_staging(src.len());
        staging.copy_from_slice(src);
        let buf = PartialBuffer::standalone(staging).ok_or(NvError::BadRequest)?;
        self.submit(Request::SyncWrite { dev, addr, src: buf, notify: sem.notifier() })?;

        let done = self.wait_done(&sem);
        if let Some(mem) = done.payload {
            sem.restore_staging(mem);
        }
        into_result(done.result)
    }

    /// Queue a write and return without waiting. `result` reads `InProgress`
    /// until the staging buffer is back in the pool, then the final outcome.
    pub fn write_async(&self, dev: NvDevId, addr: NvAddr, src: &[u8], result: &AsyncResult) -> NvResult<()> {
        let accepted = self
            .check_range(dev, addr, src.len())
            .and_then(|_| self.check_unlocked("async write"));
        if let Err(e) = accepted {
            result.set(e.into());
            return Err(e);
        }
        result.set(NvOpResult::InProgress);

        if self.config.mode == ProcessingMode::Inline {
            let res = self.run_inline(|phys| {
                let Physical { devices, page_buffer } = phys;
                write_on(devices, &self.maps, page_buffer, dev, addr, src)
            });
            result.set(res.into());
            return Ok(());
        }

        let Some(mut buf) = self.buf_pool.get_buffer(src.len()) else {
            warn!("nv: no buffer for {} byte async write", src.len());
            result.set(NvOpResult::NoBufferAvailable);
            return Err(NvError::NoBufferAvailable);
        };
        buf.copy_to_buf(src, 0);

        if let Err(e) = self.submit(Request::AsyncWrite { dev, addr, src: buf, result: result.clone() }) {
            result.set(e.into());
            return Err(e);
        }
        Ok(())
    }

    pub fn erase(&self, dev: NvDevId) -> NvResult<()> {
        self.check_device(dev)?;
        self.check_unlocked("erase")?;

        if self.config.mode == ProcessingMode::Inline {
            return self.run_inline(|phys| match phys.devices.get_mut(dev as usize) {
                Some(ops) => ops.erase(),
                None => Err(NvError::BadRequest),
            });
        }

        let sem = self.acquire_sem()?;
        self.submit(Request::Erase { dev, notify: sem.notifier() })?;
        into_result(self.wait_done(&sem).result)
    }

    /// Block until everything queued before this call has been processed.
    pub fn flush(&self, dev: NvDevId) -> NvResult<()> {
        self.check_device(dev)?;
        self.check_unlocked("flush")?;

        if self.config.mode == ProcessingMode::Inline {
            return Ok(());
        }

        let sem = self.acquire_sem()?;
        self.submit(Request::Flush { notify: sem.notifier() })?;
        into_result(self.wait_done(&sem).result)
    }

    /// Owned handle to device `id`.
    pub fn memory(self: &Arc<Self>, id: NvDevId) -> Option<NvMemoryHandle> {
        self.maps.get(id as usize)?;
        Some(NvMemoryHandle { engine: self.clone(), id })
    }

    pub fn device_count(&self) -> usize { self.maps.len() }

    pub fn address_map(&self, id: NvDevId) -> Option<AddressMap> {
        self.maps.get(id as usize).copied()
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> { &self.buf_pool }

    pub fn is_initialized(&self) -> bool { self.initialized.load(Ordering::SeqCst) }

    pub fn is_locked(&self) -> bool { self.lock.load(Ordering::SeqCst) }

    pub fn is_op_in_progress(&self) -> bool { self.op_in_progress.load(Ordering::SeqCst) }

    pub fn pending_requests(&self) -> usize { self.requests.pending() }

    pub fn free_semaphores(&self) -> usize { self.semaphores.available() }

    fn physical(&self) -> MutexGuard<'_, Physical> {
        self.physical.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_device(&self, dev: NvDevId) -> NvResult<&AddressMap> {
        if !self.is_initialized() {
            return Err(NvError::BadRequest);
        }
        self.maps.get(dev as usize).ok_or(NvError::BadRequest)
    }

    fn check_range(&self, dev: NvDevId, addr: NvAddr, len: usize) -> NvResult<()> {
        let map = self.check_device(dev)?;
        if !map.contains(addr, len) {
            debug!("nv: dev {} rejects [{:#x}; {}]", dev, addr, len);
            return Err(NvError::BadRequest);
        }
        Ok(())
    }

    fn check_unlocked(&self, op: &str) -> NvResult<()> {
        if self.is_locked() {
            warn!("nv: {} rejected, engine locked", op);
            return Err(NvError::Locked);
        }
        Ok(())
    }

    fn acquire_sem(&self) -> NvResult<PooledSemaphore<'_>> {
        self.semaphores.acquire().ok_or_else(|| {
            warn!("nv: no semaphore available");
            NvError::NoSemAvailable
        })
    }

    fn submit(&self, req: Request) -> NvResult<()> {
        if let Err(rejected) = self.requests.push(req) {
            warn!("nv: queue full, {} rejected", rejected.name());
            // Dropping the request releases any pooled buffer it carries.
            drop(rejected);
            return Err(NvError::TooManyRequests);
        }
        if let Some(idle) = &self.idle {
            idle.post();
        }
        Ok(())
    }

    fn wait_done(&self, sem: &PooledSemaphore<'_>) -> Completion {
        match sem.wait(self.config.max_wait) {
            Some(done) => done,
            None => {
                error!("nv: consumer did not signal semaphore {} within {:?}", sem.index(), self.config.max_wait);
                panic!("nv: request not completed within {:?}", self.config.max_wait);
            }
        }
    }

    fn run_inline<F>(&self, op: F) -> NvResult<()>
    where
        F: FnOnce(&mut Physical) -> NvResult<()>,
    {
        let mut phys = self.physical();
        self.op_in_progress.store(true, Ordering::SeqCst);
        let res = op(&mut phys);
        self.op_in_progress.store(false, Ordering::SeqCst);
        res
    }
}

/// Handle to one device of an engine.
#[derive(Clone)]
pub struct NvMemoryHandle {
    engine: Arc<NvEngine>,
    id: NvDevId,
}

impl NvMemoryHandle {
    pub fn id(&self) -> NvDevId { self.id }

    pub fn engine(&self) -> &Arc<NvEngine> { &self.engine }

    pub fn address_map(&self) -> AddressMap {
        // Handles are only minted for existing ids.
        self.engine.maps[self.id as usize]
    }

    pub fn read_sync(&self, addr: NvAddr, dst: &mut [u8]) -> NvResult<()> {
        self.engine.read_sync(self.id, addr, dst)
    }

    pub fn write_sync(&self, addr: NvAddr, src: &[u8]) -> NvResult<()> {
        self.engine.write_sync(self.id, addr, src)
    }

    pub fn write_async(&self, addr: NvAddr, src: &[u8], result: &AsyncResult) -> NvResult<()> {
        self.engine.write_async(self.id, addr, src, result)
    }

    pub fn erase(&self) -> NvResult<()> {
        self.engine.erase(self.id)
    }

    pub fn flush(&self) -> NvResult<()> {
        self.engine.flush(self.id)
    }
}
