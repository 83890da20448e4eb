//! Serialized NV memory engine.
//!
//! Many producers, one consumer, one shared physical resource. Producers
//! validate and enqueue; the consumer (a dedicated worker, or the locker while
//! it flushes) is the only party that ever calls into a device.

pub mod config;
mod engine;
pub mod page;
pub mod queue;
pub mod request;
pub mod sem;

pub use config::{EngineConfig, ProcessingMode};
pub use engine::{NvEngine, NvMemory, NvMemoryHandle};
pub use request::{AsyncResult, Request};

pub use uchal_bp::{BufferPool, PartialBuffer};
pub use uchal_core::{NvAddr, NvDevId, NvError, NvOpResult, NvResult};
pub use uchal_hal::{AddressMap, NvMemPeripheral};
