//! Wait handles and the reusable semaphore pool.
//!
//! A pooled semaphore is handed out drained. Every completed cycle is one
//! `give` by the consumer followed by one successful `take` by the owner, so
//! the handle returns to the pool drained again and `release` never resets it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use uchal_core::NvOpResult;
use zeroize::Zeroize;

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Binary semaphore with bounded waits.
pub struct WaitHandle {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl WaitHandle {
    /// Created "taken": the first `take` blocks until a `give`.
    pub fn new() -> Self {
        let handle = Self { signaled: Mutex::new(true), cv: Condvar::new() };
        handle.try_take();
        handle
    }

    pub fn give(&self) {
        *relock(&self.signaled) = true;
        self.cv.notify_one();
    }

    /// Wait up to `timeout` for a `give`. Returns false on timeout.
    pub fn take(&self, timeout: Duration) -> bool {
        let guard = relock(&self.signaled);
        let (mut signaled, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| !*s)
            .unwrap_or_else(PoisonError::into_inner);
        if *signaled {
            *signaled = false;
            true
        } else {
            false
        }
    }

    pub fn try_take(&self) -> bool {
        let mut signaled = relock(&self.signaled);
        core::mem::replace(&mut *signaled, false)
    }

    pub fn is_signaled(&self) -> bool {
        *relock(&self.signaled)
    }
}

impl Default for WaitHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Counting semaphore used by the consumer to sleep while the queue is empty.
pub struct CountingSemaphore {
    count: Mutex<usize>,
    max: usize,
    cv: Condvar,
}

impl CountingSemaphore {
    pub fn new(initial: usize, max: usize) -> Self {
        Self { count: Mutex::new(initial.min(max)), max, cv: Condvar::new() }
    }

    pub fn post(&self) {
        let mut count = relock(&self.count);
        if *count < self.max {
            *count += 1;
        }
        drop(count);
        self.cv.notify_one();
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = relock(&self.count);
        let (mut count, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |c| *c == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> usize {
        *relock(&self.count)
    }
}

/// Outcome delivered to a synchronous caller.
#[derive(Debug)]
pub struct Completion {
    pub result: NvOpResult,
    /// Staging memory travelling back to the caller (read data, write source).
    pub payload: Option<Vec<u8>>,
}

struct SemSlot {
    handle: WaitHandle,
    completion: spin::Mutex<Option<Completion>>,
    staging: spin::Mutex<Vec<u8>>,
}

/// Consumer side of a pooled semaphore, carried inside a request.
#[derive(Clone)]
pub struct Signal(Arc<SemSlot>);

impl Signal {
    /// Store the outcome, then wake the owner.
    pub fn complete(self, result: NvOpResult, payload: Option<Vec<u8>>) {
        *self.0.completion.lock() = Some(Completion { result, payload });
        self.0.handle.give();
    }
}

impl core::fmt::Debug for Signal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Signal")
    }
}

/// Fixed set of semaphores, one per in-flight synchronous caller.
pub struct SemaphorePool {
    slots: Vec<Arc<SemSlot>>,
    owned: spin::Mutex<Vec<bool>>,
}

impl SemaphorePool {
    pub fn create(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(size).ok()?;
        for _ in 0..size {
            slots.push(Arc::new(SemSlot {
                handle: WaitHandle::new(),
                completion: spin::Mutex::new(None),
                staging: spin::Mutex::new(Vec::new()),
            }));
        }
        Some(Self { slots, owned: spin::Mutex::new(vec![false; size]) })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.owned.lock().iter().filter(|o| !**o).count()
    }

    /// First free semaphore in slot order, or `None` when all are owned.
    pub fn acquire(&self) -> Option<PooledSemaphore<'_>> {
        let index = {
            let mut owned = self.owned.lock();
            let index = owned.iter().position(|o| !*o)?;
            owned[index] = true;
            index
        };
        let sem = PooledSemaphore { pool: self, index };
        debug_assert!(!sem.is_signaled(), "pooled semaphore handed out signaled");
        Some(sem)
    }
}

/// An owned semaphore. Always starts unsignaled; dropping it returns it to
/// the pool.
pub struct PooledSemaphore<'a> {
    pool: &'a SemaphorePool,
    index: usize,
}

impl PooledSemaphore<'_> {
    fn slot(&self) -> &Arc<SemSlot> {
        &self.pool.slots[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn notifier(&self) -> Signal {
        Signal(self.slot().clone())
    }

    pub fn is_signaled(&self) -> bool {
        self.slot().handle.is_signaled()
    }

    /// Block until the request carrying this semaphore completes.
    /// `None` when `timeout` expires first.
    pub fn wait(&self, timeout: Duration) -> Option<Completion> {
        if !self.slot().handle.take(timeout) {
            return None;
        }
        self.slot().completion.lock().take()
    }

    /// Borrow the slot's staging memory, resized to `len` zeroed bytes.
    pub fn take_staging(&self, len: usize) -> Vec<u8> {
        let mut mem = core::mem::take(&mut *self.slot().staging.lock());
        mem.clear();
        mem.resize(len, 0);
        mem
    }

    pub fn restore_staging(&self, mut mem: Vec<u8>) {
        mem.zeroize();
        *self.slot().staging.lock() = mem;
    }
}

impl Drop for PooledSemaphore<'_> {
    fn drop(&mut self) {
        self.slot().completion.lock().take();
        self.slot().staging.lock().zeroize();
        self.pool.owned.lock()[self.index] = false;
    }
}
