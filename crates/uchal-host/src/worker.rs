use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use uchal_nv::NvEngine;

/// The one consumer thread of an engine.
pub struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl Worker {
    pub fn spawn(engine: Arc<NvEngine>, pin_core: Option<usize>) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let s = stop.clone();
        let handle = thread::Builder::new().name("nv-worker".into()).spawn(move || {
            if let Some(core) = pin_core {
                pin_to(core);
            }
            let mut processed = 0u64;
            while !s.load(Ordering::Relaxed) {
                if engine.process_requests() {
                    processed += 1;
                } else {
                    thread::yield_now();
                }
            }
            processed
        })?;
        info!("nv: worker started");
        Ok(Self { stop, handle: Some(handle) })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop and join. Returns the number of requests processed.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        let Some(handle) = self.handle.take() else { return 0 };
        match handle.join() {
            Ok(processed) => {
                info!("nv: worker stopped after {} request(s)", processed);
                processed
            }
            Err(_) => {
                error!("nv: worker panicked");
                0
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pin_to(core: usize) {
    let target = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|id| id.id == core);
    match target {
        Some(id) if core_affinity::set_for_current(id) => info!("nv: worker pinned to core {}", core),
        _ => warn!("nv: could not pin worker to core {}", core),
    }
}
