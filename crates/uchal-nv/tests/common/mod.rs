#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use uchal_nv::{NvAddr, NvError, NvMemPeripheral, NvResult};

// --- MOCKS ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read(NvAddr, usize),
    Write(NvAddr, usize),
    Erase,
}

#[derive(Default)]
pub struct Probe {
    pub image: Vec<u8>,
    pub ops: Vec<Op>,
    pub inits: u32,
    pub deinits: u32,
    pub fail_read: bool,
    pub fail_write_at: Option<NvAddr>,
    pub fail_erase: bool,
}

#[derive(Clone)]
pub struct ProbeHandle(Arc<Mutex<Probe>>);

impl ProbeHandle {
    pub fn get(&self) -> MutexGuard<'_, Probe> {
        self.0.lock().unwrap()
    }
    pub fn image(&self) -> Vec<u8> {
        self.get().image.clone()
    }
    pub fn ops(&self) -> Vec<Op> {
        self.get().ops.clone()
    }
    pub fn clear_ops(&self) {
        self.get().ops.clear();
    }
}

/// Blocks inside `write` until released, to hold the consumer mid-operation.
pub struct Gate {
    pub entered: Sender<()>,
    pub release: Receiver<()>,
}

pub struct MockFlash {
    base: NvAddr,
    probe: ProbeHandle,
    gate: Option<Gate>,
}

impl MockFlash {
    pub fn new(base: NvAddr, size: usize, fill: u8) -> (Self, ProbeHandle) {
        let probe = ProbeHandle(Arc::new(Mutex::new(Probe {
            image: vec![fill; size],
            ..Probe::default()
        })));
        (Self { base, probe: probe.clone(), gate: None }, probe)
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    fn range(&self, addr: NvAddr, len: usize) -> std::ops::Range<usize> {
        let start = (addr - self.base) as usize;
        start..start + len
    }
}

impl NvMemPeripheral for MockFlash {
    fn init(&mut self) {
        self.probe.get().inits += 1;
    }

    fn deinit(&mut self) {
        self.probe.get().deinits += 1;
    }

    fn read(&mut self, addr: NvAddr, dst: &mut [u8]) -> NvResult<()> {
        let range = self.range(addr, dst.len());
        let mut p = self.probe.get();
        p.ops.push(Op::Read(addr, dst.len()));
        if p.fail_read {
            return Err(NvError::DeviceReadError);
        }
        dst.copy_from_slice(&p.image[range]);
        Ok(())
    }

    fn write(&mut self, page_addr: NvAddr, page: &[u8]) -> NvResult<()> {
        if let Some(gate) = &self.gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        let range = self.range(page_addr, page.len());
        let mut p = self.probe.get();
        p.ops.push(Op::Write(page_addr, page.len()));
        if p.fail_write_at == Some(page_addr) {
            return Err(NvError::DeviceWriteError);
        }
        p.image[range].copy_from_slice(page);
        Ok(())
    }

    fn erase(&mut self) -> NvResult<()> {
        let mut p = self.probe.get();
        p.ops.push(Op::Erase);
        if p.fail_erase {
            return Err(NvError::DeviceEraseError);
        }
        p.image.fill(0xFF);
        Ok(())
    }
}

// --- WORKER ---
pub struct TestWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestWorker {
    pub fn spawn(engine: Arc<uchal_nv::NvEngine>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let s = stop.clone();
        let handle = thread::spawn(move || {
            while !s.load(Ordering::SeqCst) {
                if !engine.process_requests() {
                    thread::yield_now();
                }
            }
        });
        Self { stop, handle: Some(handle) }
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

pub fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
