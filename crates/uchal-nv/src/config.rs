use std::time::Duration;

use uchal_core::NV_MAX_DELAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Requests are queued and drained by one dedicated consumer thread.
    Worker,
    /// No consumer: every operation runs on the calling thread.
    Inline,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub sem_pool_size: usize,
    /// Bound on every semaphore take.
    pub max_wait: Duration,
    /// Let the consumer sleep on a counting semaphore while the queue is empty.
    pub idle_wait: bool,
    pub mode: ProcessingMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            sem_pool_size: 4,
            max_wait: Duration::from_millis(NV_MAX_DELAY_MS),
            idle_wait: false,
            mode: ProcessingMode::Worker,
        }
    }
}
