use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use log::{debug, error, info, warn};
use rand::Rng;
use uchal_host::{FileDevice, RamDevice, Worker};
use uchal_nv::{
    AddressMap, AsyncResult, BufferPool, EngineConfig, NvAddr, NvEngine, NvError, NvMemPeripheral, NvMemory,
    NvMemoryHandle, ProcessingMode,
};

/// Drive an NV engine with concurrent producers over a RAM or file image.
#[derive(Parser)]
struct Cli {
    /// Back the device with this file instead of RAM.
    #[arg(long)] image: Option<PathBuf>,
    #[arg(long, default_value_t = 64 * 1024)] size: u32,
    /// Write unit in bytes.
    #[arg(long, default_value_t = 256)] page: u32,
    #[arg(long, default_value_t = 16)] chunks: usize,
    #[arg(long, default_value_t = 64)] chunk_size: usize,
    #[arg(long, default_value_t = 16)] queue: usize,
    #[arg(long, default_value_t = 4)] sems: usize,
    #[arg(long, default_value_t = 4)] producers: u32,
    /// Operations per producer.
    #[arg(long, default_value_t = 1000)] ops: u32,
    #[arg(long)] idle_wait: bool,
    #[arg(long, default_value_t = 1000)] max_wait_ms: u64,
    #[arg(long)] pin_core: Option<usize>,
}

#[derive(Default)]
struct Tally {
    sync_ok: u64,
    async_ok: u64,
    busy: u64,
    mismatches: u64,
    failures: u64,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.sync_ok += other.sync_ok;
        self.async_ok += other.async_ok;
        self.busy += other.busy;
        self.mismatches += other.mismatches;
        self.failures += other.failures;
    }

    /// Transient resource exhaustion is retried, anything else is a failure.
    fn record(&mut self, err: NvError) {
        match err {
            NvError::NoSemAvailable | NvError::NoBufferAvailable | NvError::TooManyRequests => {
                self.busy += 1;
                thread::yield_now();
            }
            other => {
                warn!("producer: {}", other);
                self.failures += 1;
            }
        }
    }
}

fn open_device(cli: &Cli) -> anyhow::Result<(AddressMap, Box<dyn NvMemPeripheral>)> {
    let unmappable = || anyhow!("{} bytes with {} byte pages is not addressable", cli.size, cli.page);
    match &cli.image {
        Some(path) => {
            let dev = FileDevice::open(path, 0, u64::from(cli.size))?;
            let map = dev.address_map(cli.page).ok_or_else(unmappable)?;
            info!("Device: file {}", path.display());
            let dev: Box<dyn NvMemPeripheral> = Box::new(dev);
            Ok((map, dev))
        }
        None => {
            let dev = RamDevice::new(0, cli.size as usize);
            let map = dev.address_map(cli.page).ok_or_else(unmappable)?;
            info!("Device: {} bytes of RAM", cli.size);
            let dev: Box<dyn NvMemPeripheral> = Box::new(dev);
            Ok((map, dev))
        }
    }
}

fn produce(mem: NvMemoryHandle, base: NvAddr, span: usize, ops: u32, max_wait: Duration, running: Arc<AtomicBool>) -> Tally {
    let mut rng = rand::thread_rng();
    let mut tally = Tally::default();
    let max_len = span.min(4 * mem.address_map().write_unit() as usize).max(1);
    let mut data = vec![0u8; max_len];
    let mut back = vec![0u8; max_len];

    for n in 0..ops {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let len = rng.gen_range(1..=max_len);
        let addr = base + rng.gen_range(0..=span - len) as NvAddr;
        rng.fill(&mut data[..len]);

        let written = if n % 2 == 0 {
            mem.write_sync(addr, &data[..len]).map(|_| tally.sync_ok += 1)
        } else {
            let result = AsyncResult::new();
            match mem.write_async(addr, &data[..len], &result) {
                Ok(()) => match result.block(max_wait) {
                    Ok(()) => {
                        tally.async_ok += 1;
                        Ok(())
                    }
                    Err(nb::Error::Other(e)) => Err(e),
                    Err(nb::Error::WouldBlock) => {
                        error!("producer: async write at {:#x} not done within {:?}", addr, max_wait);
                        tally.failures += 1;
                        continue;
                    }
                },
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            tally.record(e);
            continue;
        }

        match mem.read_sync(addr, &mut back[..len]) {
            Ok(()) if back[..len] == data[..len] => {}
            Ok(()) => {
                error!("producer: readback mismatch at {:#x} ({} bytes)", addr, len);
                tally.mismatches += 1;
            }
            Err(e) => tally.record(e),
        }
    }
    tally
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    info!(">>> UCHAL NVTOOL <<<");

    if cli.producers == 0 {
        bail!("--producers must be at least 1");
    }
    let (map, dev) = open_device(&cli)?;
    let pool = BufferPool::create(cli.chunks, cli.chunk_size)
        .ok_or_else(|| anyhow!("cannot allocate {} x {} byte chunks", cli.chunks, cli.chunk_size))?;

    let config = EngineConfig {
        queue_capacity: cli.queue,
        sem_pool_size: cli.sems,
        max_wait: Duration::from_millis(cli.max_wait_ms),
        idle_wait: cli.idle_wait,
        mode: ProcessingMode::Worker,
    };
    let engine = NvEngine::init(vec![NvMemory::from_boxed(map, dev)], vec![0; cli.page as usize], config, pool)
        .context("engine init")?;
    let mem = engine.memory(0).ok_or_else(|| anyhow!("device 0 missing"))?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        warn!("Signal received. Stopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    let worker = Worker::spawn(engine.clone(), cli.pin_core)?;
    let span = ((map.end() - map.start()) as usize + 1) / cli.producers as usize;
    if span == 0 {
        bail!("device too small for {} producers", cli.producers);
    }
    let started = Instant::now();

    let producers: Vec<JoinHandle<Tally>> = (0..cli.producers)
        .map(|p| {
            let mem = mem.clone();
            let base = map.start() + p * span as NvAddr;
            let running = running.clone();
            let (ops, max_wait) = (cli.ops, config.max_wait);
            debug!("producer {}: [{:#x}; {}]", p, base, span);
            thread::spawn(move || produce(mem, base, span, ops, max_wait, running))
        })
        .collect();

    let mut tally = Tally::default();
    for p in producers {
        match p.join() {
            Ok(t) => tally.merge(t),
            Err(_) => bail!("producer panicked"),
        }
    }

    mem.flush().context("flush")?;
    loop {
        match engine.lock(true) {
            Err(nb::Error::WouldBlock) => thread::yield_now(),
            Err(nb::Error::Other(e)) => return Err(e).context("lock"),
            Ok(()) => break,
        }
    }
    let processed = worker.stop();
    let elapsed = started.elapsed();

    info!(
        "Done in {:?}: {} requests, {} sync + {} async writes verified, {} busy retries, {} failures, {} mismatches",
        elapsed, processed, tally.sync_ok, tally.async_ok, tally.busy, tally.failures, tally.mismatches
    );
    info!("Pool: {}/{} chunks free", engine.buffer_pool().available(), engine.buffer_pool().total_chunks());
    engine.deinit();

    if tally.mismatches > 0 {
        bail!("{} readback mismatch(es)", tally.mismatches);
    }
    Ok(())
}
