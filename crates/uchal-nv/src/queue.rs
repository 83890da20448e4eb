use spin::Mutex;

use crate::request::Request;

struct QueueState {
    slots: Vec<Request>,
    pending: usize,
    head: usize,
    tail: usize,
}

/// Bounded FIFO of pending requests.
///
/// A slot is filled inside the same critical section that publishes it, so
/// the consumer never observes a half-written request.
pub struct RequestQueue {
    state: Mutex<QueueState>,
    capacity: usize,
}

impl RequestQueue {
    pub fn create(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).ok()?;
        slots.resize_with(capacity, Request::default);
        Some(Self {
            state: Mutex::new(QueueState { slots, pending: 0, head: 0, tail: 0 }),
            capacity,
        })
    }

    /// Enqueue at `tail`. A full queue hands the request back.
    pub fn push(&self, req: Request) -> Result<(), Request> {
        let mut q = self.state.lock();
        if q.pending >= self.capacity {
            return Err(req);
        }
        let tail = q.tail;
        q.slots[tail] = req;
        q.tail = (tail + 1) % self.capacity;
        q.pending += 1;
        Ok(())
    }

    /// Dequeue from `head`.
    pub fn pop(&self) -> Option<Request> {
        let mut q = self.state.lock();
        if q.pending == 0 {
            return None;
        }
        let head = q.head;
        let req = core::mem::take(&mut q.slots[head]);
        q.head = (head + 1) % self.capacity;
        q.pending -= 1;
        Some(req)
    }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn pending(&self) -> usize { self.state.lock().pending }

    pub fn head(&self) -> usize { self.state.lock().head }

    pub fn tail(&self) -> usize { self.state.lock().tail }

    pub fn is_empty(&self) -> bool { self.pending() == 0 }

    pub fn is_full(&self) -> bool { self.pending() == self.capacity }
}
