mod common;

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use common::{wait_until, Gate, MockFlash, Op, ProbeHandle, TestWorker};
use uchal_nv::{
    AddressMap, AsyncResult, BufferPool, EngineConfig, NvEngine, NvError, NvMemory, NvOpResult, ProcessingMode,
};

const FILL: u8 = 0xEE;

fn config() -> EngineConfig {
    EngineConfig { max_wait: Duration::from_secs(5), ..EngineConfig::default() }
}

fn single(size: usize, unit: u32, cfg: EngineConfig, pool: Arc<BufferPool>) -> (Arc<NvEngine>, ProbeHandle) {
    let (dev, probe) = MockFlash::new(0, size, FILL);
    let map = AddressMap::new(0, size as u32 - 1, unit).unwrap();
    let engine = NvEngine::init(vec![NvMemory::new(map, dev)], vec![0; unit as usize], cfg, pool).unwrap();
    (engine, probe)
}

fn default_engine() -> (Arc<NvEngine>, ProbeHandle) {
    single(1024, 256, config(), BufferPool::create(16, 64).unwrap())
}

#[test]
fn test_sync_round_trip_through_worker() {
    let (engine, probe) = default_engine();
    let _worker = TestWorker::spawn(engine.clone());

    let data = common::pattern(20, 9);
    engine.write_sync(0, 250, &data).unwrap();

    let mut back = [0u8; 20];
    engine.read_sync(0, 250, &mut back).unwrap();
    assert_eq!(&back[..], data.as_slice());

    let ops = probe.ops();
    assert_eq!(&ops[..4], &[Op::Read(0, 256), Op::Write(0, 256), Op::Read(256, 256), Op::Write(256, 256)]);
    let image = probe.image();
    assert_eq!(image[249], FILL);
    assert_eq!(image[270], FILL);
    assert_eq!(engine.free_semaphores(), 4);
}

#[test]
fn test_async_write_holds_buffer_until_processed() {
    let pool = BufferPool::create(2, 16).unwrap();
    let (engine, probe) = single(256, 64, config(), pool.clone());
    let data = common::pattern(24, 4);
    let result = AsyncResult::new();

    engine.write_async(0, 8, &data, &result).unwrap();
    assert_eq!(result.status(), NvOpResult::InProgress);
    assert_eq!(result.poll(), Err(nb::Error::WouldBlock));
    assert_eq!(pool.available(), 0);
    assert_eq!(engine.pending_requests(), 1);

    assert!(engine.process_requests());
    assert_eq!(result.status(), NvOpResult::Ok);
    assert_eq!(pool.available(), 2);
    assert_eq!(&probe.image()[8..32], data.as_slice());
    assert!(!engine.process_requests());
}

#[test]
fn test_async_slot_only_tracks_accepted_writes() {
    let (engine, _probe) = default_engine();
    let result = AsyncResult::new();
    assert_eq!(result.status(), NvOpResult::Ok);

    engine.write_async(0, 0, &[1u8; 4], &result).unwrap();
    let watcher = result.clone();
    assert_eq!(watcher.poll(), Err(nb::Error::WouldBlock));
    assert!(engine.process_requests());
    assert_eq!(watcher.poll(), Ok(()));
}

#[test]
fn test_async_write_reports_device_failure() {
    let pool = BufferPool::create(8, 64).unwrap();
    let (engine, probe) = single(1024, 256, config(), pool.clone());
    probe.get().fail_write_at = Some(256);
    let result = AsyncResult::new();

    engine.write_async(0, 200, &[1u8; 100], &result).unwrap();
    assert!(engine.process_requests());

    assert_eq!(result.status(), NvOpResult::DeviceWriteError);
    assert_eq!(result.poll(), Err(nb::Error::Other(NvError::DeviceWriteError)));
    assert_eq!(pool.available(), 8);
    assert_eq!(&probe.image()[200..256], &[1u8; 56][..]);
}

#[test]
fn test_sync_write_reports_device_failure() {
    let (engine, probe) = default_engine();
    probe.get().fail_write_at = Some(512);
    let _worker = TestWorker::spawn(engine.clone());

    assert_eq!(engine.write_sync(0, 0, &[3u8; 768]), Err(NvError::DeviceWriteError));
    assert_eq!(probe.ops(), vec![Op::Write(0, 256), Op::Write(256, 256), Op::Write(512, 256)]);
}

#[test]
fn test_read_failure_leaves_destination_untouched() {
    let (engine, probe) = default_engine();
    probe.get().fail_read = true;
    let _worker = TestWorker::spawn(engine.clone());

    let mut dst = [0x11u8; 8];
    assert_eq!(engine.read_sync(0, 0, &mut dst), Err(NvError::DeviceReadError));
    assert_eq!(dst, [0x11; 8]);
}

#[test]
fn test_erase_through_worker() {
    let (engine, probe) = default_engine();
    let _worker = TestWorker::spawn(engine.clone());

    engine.write_sync(0, 0, &[0u8; 16]).unwrap();
    engine.erase(0).unwrap();
    assert!(probe.image().iter().all(|b| *b == 0xFF));

    probe.get().fail_erase = true;
    assert_eq!(engine.erase(0), Err(NvError::DeviceEraseError));
}

#[test]
fn test_requests_are_validated_before_queueing() {
    let (engine, _probe) = default_engine();
    let mut buf = [0u8; 4];

    assert_eq!(engine.read_sync(0, 0, &mut []), Err(NvError::BadRequest));
    assert_eq!(engine.read_sync(0, 1021, &mut buf), Err(NvError::BadRequest));
    assert_eq!(engine.write_sync(1, 0, &buf), Err(NvError::BadRequest));
    assert_eq!(engine.erase(7), Err(NvError::BadRequest));
    assert_eq!(engine.flush(7), Err(NvError::BadRequest));

    let result = AsyncResult::new();
    assert_eq!(engine.write_async(0, 1024, &buf, &result), Err(NvError::BadRequest));
    assert_eq!(result.status(), NvOpResult::BadRequest);
    assert_eq!(engine.pending_requests(), 0);

    // The last addressable byte is inside the range.
    let _worker = TestWorker::spawn(engine.clone());
    engine.write_sync(0, 1023, &[7]).unwrap();
}

#[test]
fn test_lock_rejects_without_queueing() {
    let (engine, _probe) = default_engine();
    let early = AsyncResult::new();
    engine.write_async(0, 0, &[1u8; 8], &early).unwrap();

    engine.lock(false).unwrap();
    assert!(engine.is_locked());

    let mut buf = [0u8; 8];
    assert_eq!(engine.read_sync(0, 0, &mut buf), Err(NvError::Locked));
    assert_eq!(engine.write_sync(0, 0, &buf), Err(NvError::Locked));
    assert_eq!(engine.erase(0), Err(NvError::Locked));
    assert_eq!(engine.flush(0), Err(NvError::Locked));
    let late = AsyncResult::new();
    assert_eq!(engine.write_async(0, 0, &buf, &late), Err(NvError::Locked));
    assert_eq!(late.status(), NvOpResult::Locked);

    // Range errors win over the lock.
    assert_eq!(engine.write_sync(0, 2000, &buf), Err(NvError::BadRequest));

    // The consumer stays out while locked.
    assert!(!engine.process_requests());
    assert_eq!(engine.pending_requests(), 1);

    engine.unlock();
    assert!(engine.process_requests());
    assert_eq!(early.status(), NvOpResult::Ok);
}

#[test]
fn test_lock_with_flush_drains_queue() {
    let (engine, probe) = default_engine();
    let results: Vec<AsyncResult> = (0..3).map(|_| AsyncResult::new()).collect();
    for (i, r) in results.iter().enumerate() {
        engine.write_async(0, i as u32 * 256, &[i as u8 + 1; 256], r).unwrap();
    }

    assert_eq!(engine.lock(true), Ok(()));
    assert_eq!(engine.pending_requests(), 0);
    assert!(results.iter().all(|r| r.status() == NvOpResult::Ok));
    assert_eq!(probe.image()[512], 3);
    assert_eq!(engine.buffer_pool().available(), 16);
}

#[test]
fn test_lock_with_flush_would_block_mid_operation() {
    let (entered_tx, entered_rx) = channel();
    let (release_tx, release_rx) = channel();
    let (dev, probe) = MockFlash::new(0, 256, FILL);
    let dev = dev.with_gate(Gate { entered: entered_tx, release: release_rx });
    let map = AddressMap::new(0, 255, 64).unwrap();
    let engine =
        NvEngine::init(vec![NvMemory::new(map, dev)], vec![0; 64], config(), BufferPool::create(2, 64).unwrap())
            .unwrap();

    let result = AsyncResult::new();
    engine.write_async(0, 0, &[5u8; 64], &result).unwrap();

    let consumer = {
        let engine = engine.clone();
        thread::spawn(move || engine.process_requests())
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(engine.lock(true), Err(nb::Error::WouldBlock));
    assert!(engine.is_op_in_progress());
    assert!(engine.is_locked());

    release_tx.send(()).unwrap();
    assert!(consumer.join().unwrap());
    assert_eq!(engine.lock(true), Ok(()));
    assert!(!engine.is_op_in_progress());
    assert_eq!(result.status(), NvOpResult::Ok);
    assert_eq!(probe.image()[0], 5);
}

#[test]
fn test_full_queue_returns_buffer() {
    let pool = BufferPool::create(3, 16).unwrap();
    let cfg = EngineConfig { queue_capacity: 2, ..config() };
    let (engine, _probe) = single(256, 16, cfg, pool.clone());

    let a = AsyncResult::new();
    let b = AsyncResult::new();
    let c = AsyncResult::new();
    engine.write_async(0, 0, &[1u8; 16], &a).unwrap();
    engine.write_async(0, 16, &[2u8; 16], &b).unwrap();
    assert_eq!(pool.available(), 1);

    assert_eq!(engine.write_async(0, 32, &[3u8; 16], &c), Err(NvError::TooManyRequests));
    assert_eq!(c.status(), NvOpResult::TooManyRequests);
    assert_eq!(pool.available(), 1);
    assert_eq!(engine.pending_requests(), 2);

    while engine.process_requests() {}
    assert_eq!(pool.available(), 3);
}

#[test]
fn test_async_write_without_buffer() {
    let pool = BufferPool::create(1, 16).unwrap();
    let (engine, _probe) = single(256, 16, config(), pool.clone());
    let result = AsyncResult::new();

    assert_eq!(engine.write_async(0, 0, &[0u8; 32], &result), Err(NvError::NoBufferAvailable));
    assert_eq!(result.status(), NvOpResult::NoBufferAvailable);
    assert_eq!(engine.pending_requests(), 0);
    assert_eq!(pool.available(), 1);
}

#[test]
fn test_no_semaphore_available() {
    let cfg = EngineConfig { sem_pool_size: 1, ..config() };
    let (engine, _probe) = single(256, 64, cfg, BufferPool::create(2, 64).unwrap());

    let reader = {
        let engine = engine.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 4];
            engine.read_sync(0, 0, &mut buf).map(|_| buf)
        })
    };
    wait_until("queued read", || engine.pending_requests() == 1);
    assert_eq!(engine.free_semaphores(), 0);

    let mut buf = [0u8; 4];
    assert_eq!(engine.read_sync(0, 0, &mut buf), Err(NvError::NoSemAvailable));

    assert!(engine.process_requests());
    assert_eq!(reader.join().unwrap(), Ok([FILL; 4]));
    assert_eq!(engine.free_semaphores(), 1);
}

#[test]
fn test_flush_waits_for_earlier_requests() {
    let cfg = EngineConfig { sem_pool_size: 8, queue_capacity: 8, ..config() };
    let (engine, probe) = single(1024, 64, cfg, BufferPool::create(2, 64).unwrap());

    let writers: Vec<_> = (0..5u8)
        .map(|i| {
            let engine = engine.clone();
            thread::spawn(move || engine.write_sync(0, i as u32 * 100, &[i + 1; 50]))
        })
        .collect();
    wait_until("five writes", || engine.pending_requests() == 5);

    let flusher = {
        let engine = engine.clone();
        thread::spawn(move || engine.flush(0))
    };
    wait_until("flush", || engine.pending_requests() == 6);

    let _worker = TestWorker::spawn(engine.clone());
    assert_eq!(flusher.join().unwrap(), Ok(()));
    assert_eq!(engine.pending_requests(), 0);
    let image = probe.image();
    for i in 0..5usize {
        assert_eq!(image[i * 100], i as u8 + 1);
        assert_eq!(image[i * 100 + 49], i as u8 + 1);
    }
    for w in writers {
        assert_eq!(w.join().unwrap(), Ok(()));
    }
}

#[test]
fn test_concurrent_producers() {
    let cfg = EngineConfig { sem_pool_size: 4, ..config() };
    let (engine, _probe) = single(4096, 64, cfg, BufferPool::create(4, 64).unwrap());
    let _worker = TestWorker::spawn(engine.clone());

    let producers: Vec<_> = (0..4u32)
        .map(|p| {
            let mem = engine.memory(0).unwrap();
            thread::spawn(move || {
                for n in 0..20u32 {
                    let addr = p * 1024 + n * 40 + 3;
                    let data = common::pattern(37, (p * 20 + n) as u8);
                    mem.write_sync(addr, &data).unwrap();
                    let mut back = vec![0u8; 37];
                    mem.read_sync(addr, &mut back).unwrap();
                    assert_eq!(back, data);
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(engine.free_semaphores(), 4);
}

#[test]
fn test_deinit_refuses_further_work() {
    let (engine, probe) = default_engine();
    assert_eq!(probe.get().inits, 1);
    let worker = TestWorker::spawn(engine.clone());
    engine.write_sync(0, 0, &[1u8; 4]).unwrap();

    engine.deinit();
    engine.deinit();
    drop(worker);
    assert_eq!(probe.get().deinits, 1);
    assert!(!engine.is_initialized());

    let mut buf = [0u8; 4];
    assert_eq!(engine.read_sync(0, 0, &mut buf), Err(NvError::BadRequest));
    assert_eq!(engine.write_sync(0, 0, &buf), Err(NvError::BadRequest));
    assert_eq!(engine.erase(0), Err(NvError::BadRequest));
    assert_eq!(engine.flush(0), Err(NvError::BadRequest));
    let result = AsyncResult::new();
    assert_eq!(engine.write_async(0, 0, &buf, &result), Err(NvError::BadRequest));
    assert_eq!(result.status(), NvOpResult::BadRequest);
    assert!(!engine.process_requests());
}

#[test]
fn test_deinit_drains_queued_writes() {
    let (engine, probe) = default_engine();
    let result = AsyncResult::new();
    engine.write_async(0, 10, &[4u8; 10], &result).unwrap();

    engine.deinit();
    assert_eq!(result.status(), NvOpResult::Ok);
    assert_eq!(probe.image()[10], 4);
    assert_eq!(engine.buffer_pool().available(), 16);
}

#[test]
fn test_inline_mode_runs_on_caller() {
    let cfg = EngineConfig { mode: ProcessingMode::Inline, ..config() };
    let (engine, probe) = single(512, 128, cfg, BufferPool::create(1, 16).unwrap());

    engine.write_sync(0, 100, &[9u8; 40]).unwrap();
    let mut back = [0u8; 40];
    engine.read_sync(0, 100, &mut back).unwrap();
    assert_eq!(back, [9u8; 40]);

    // The pool is never touched: a payload larger than it still goes through.
    let result = AsyncResult::new();
    engine.write_async(0, 300, &[8u8; 64], &result).unwrap();
    assert_eq!(result.status(), NvOpResult::Ok);
    assert_eq!(probe.image()[363], 8);

    assert_eq!(engine.flush(0), Ok(()));
    assert!(!engine.process_requests());
    engine.erase(0).unwrap();
    assert!(probe.image().iter().all(|b| *b == 0xFF));
    assert_eq!(engine.pending_requests(), 0);
}

#[test]
fn test_idle_wait_consumer() {
    let cfg = EngineConfig { idle_wait: true, max_wait: Duration::from_millis(50), ..config() };
    let (engine, _probe) = single(256, 64, cfg, BufferPool::create(2, 64).unwrap());

    let start = Instant::now();
    assert!(!engine.process_requests());
    assert!(start.elapsed() >= Duration::from_millis(50));

    let result = AsyncResult::new();
    engine.write_async(0, 0, &[2u8; 8], &result).unwrap();
    assert!(engine.process_requests());
    assert_eq!(result.status(), NvOpResult::Ok);

    let _worker = TestWorker::spawn(engine.clone());
    let mut back = [0u8; 8];
    engine.read_sync(0, 0, &mut back).unwrap();
    assert_eq!(back, [2u8; 8]);
}

#[test]
fn test_idle_wait_serves_request_accepted_before_lock() {
    let cfg = EngineConfig { idle_wait: true, max_wait: Duration::from_millis(200), ..config() };
    let (engine, probe) = single(256, 64, cfg, BufferPool::create(2, 64).unwrap());
    let _worker = TestWorker::spawn(engine.clone());

    for round in 0..10u8 {
        // Let the worker park on the idle semaphore.
        thread::sleep(Duration::from_millis(5));
        let result = AsyncResult::new();
        engine.write_async(0, 0, &[round; 8], &result).unwrap();
        engine.lock(false).unwrap();
        thread::sleep(Duration::from_millis(20));
        engine.unlock();

        assert_eq!(result.block(Duration::from_secs(2)), Ok(()), "round {}", round);
        assert_eq!(engine.pending_requests(), 0);
        assert_eq!(probe.image()[0], round);
    }
}

#[test]
fn test_devices_share_one_engine() {
    let (d0, p0) = MockFlash::new(0, 512, FILL);
    let (d1, p1) = MockFlash::new(0x1000, 256, FILL);
    let devices = vec![
        NvMemory::new(AddressMap::new(0, 511, 64).unwrap(), d0),
        NvMemory::new(AddressMap::new(0x1000, 0x10FF, 32).unwrap(), d1),
    ];
    let engine = NvEngine::init(devices, vec![0; 64], config(), BufferPool::create(4, 32).unwrap()).unwrap();
    let _worker = TestWorker::spawn(engine.clone());

    assert_eq!(engine.device_count(), 2);
    assert!(engine.memory(2).is_none());
    let m1 = engine.memory(1).unwrap();
    assert_eq!(m1.address_map().start(), 0x1000);

    engine.memory(0).unwrap().write_sync(5, &[1u8; 3]).unwrap();
    m1.write_sync(0x1010, &[2u8; 40]).unwrap();
    assert_eq!(m1.write_sync(0x10, &[0u8; 1]), Err(NvError::BadRequest));

    let result = AsyncResult::new();
    m1.write_async(0x1004, &[3u8; 4], &result).unwrap();
    assert_eq!(result.block(Duration::from_secs(5)), Ok(()));
    m1.flush().unwrap();

    assert_eq!(p0.image()[5], 1);
    assert_eq!(p1.image()[0x10], 2);
    assert_eq!(p1.image()[0x04], 3);
    assert_eq!(&p1.ops()[..2], &[Op::Read(0x1000, 32), Op::Write(0x1000, 32)]);
}

#[test]
fn test_init_validation() {
    let pool = BufferPool::create(1, 16).unwrap();
    let device = || {
        let (dev, _) = MockFlash::new(0, 256, FILL);
        NvMemory::new(AddressMap::new(0, 255, 64).unwrap(), dev)
    };

    assert_eq!(NvEngine::init(vec![], vec![0; 64], config(), pool.clone()).err(), Some(NvError::BadRequest));
    assert_eq!(NvEngine::init(vec![device()], vec![0; 32], config(), pool.clone()).err(), Some(NvError::BadRequest));
    let cfg = EngineConfig { queue_capacity: 0, ..config() };
    assert_eq!(NvEngine::init(vec![device()], vec![0; 64], cfg, pool.clone()).err(), Some(NvError::BadRequest));
    let cfg = EngineConfig { sem_pool_size: 0, ..config() };
    assert_eq!(NvEngine::init(vec![device()], vec![0; 64], cfg, pool.clone()).err(), Some(NvError::BadRequest));

    let engine = NvEngine::init(vec![device()], vec![0; 64], config(), pool).unwrap();
    assert!(engine.is_initialized());
    assert!(!engine.is_locked());
    assert_eq!(engine.config().queue_capacity, 16);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_engine_round_trip(
        addr in 0u32..1024,
        len in 1usize..200,
        unit in prop::sample::select(vec![1u32, 8, 64, 256]),
        seed in any::<u8>(),
    ) {
        let len = len.min(1024 - addr as usize);
        let (engine, probe) = single(1024, unit, config(), BufferPool::create(4, 64).unwrap());
        let _worker = TestWorker::spawn(engine.clone());
        let data = common::pattern(len, seed);

        engine.write_sync(0, addr, &data).unwrap();
        let mut back = vec![0u8; len];
        engine.read_sync(0, addr, &mut back).unwrap();
        prop_assert_eq!(&back, &data);

        let start = addr as usize;
        let image = probe.image();
        prop_assert!(image[..start].iter().all(|b| *b == FILL));
        prop_assert!(image[start + len..].iter().all(|b| *b == FILL));

        // The async path goes through the pool instead of the staging memory.
        let result = AsyncResult::new();
        let flipped: Vec<u8> = data.iter().map(|b| !b).collect();
        engine.write_async(0, addr, &flipped, &result).unwrap();
        prop_assert_eq!(result.block(Duration::from_secs(5)), Ok(()));
        engine.read_sync(0, addr, &mut back).unwrap();
        prop_assert_eq!(&back, &flipped);
    }
}
