//! End-to-end dispatch scenarios against a scripted device.
//!
//! The device is a pair of channels: the engine's writer lands payloads on
//! `written_rx`, and the test (acting as the device) pushes response bytes
//! through `device_tx` into the real frame assembler, which frames them by
//! the 50 ms quiet gap exactly as a serial read loop would.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use ttyhub_dispatch_lib::{
    run_frame_assembler, Engine, LinkReader, LinkWriter, FRAME_QUIET, REAP_TICK, REQUEST_TIMEOUT,
};

struct DeviceWriter {
    written_tx: Sender<Vec<u8>>,
    fail: Arc<AtomicBool>,
}

impl LinkWriter for DeviceWriter {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        self.written_tx.send(buf.to_vec()).unwrap();
        Ok(())
    }
}

struct DeviceReader {
    rx: Receiver<Vec<u8>>,
}

impl LinkReader for DeviceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv_timeout(FRAME_QUIET) {
            Ok(chunk) => {
                assert!(chunk.len() <= buf.len());
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "quiet period"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))
            }
        }
    }
}

struct Harness {
    engine: Arc<Engine>,
    written_rx: Receiver<Vec<u8>>,
    device_tx: Sender<Vec<u8>>,
    fail: Arc<AtomicBool>,
}

fn start_harness() -> Harness {
    let (written_tx, written_rx) = mpsc::channel();
    let (device_tx, device_rx) = mpsc::channel();
    let fail = Arc::new(AtomicBool::new(false));

    let engine = Engine::start(Box::new(DeviceWriter {
        written_tx,
        fail: fail.clone(),
    }));

    let assembler_engine = engine.clone();
    thread::spawn(move || {
        run_frame_assembler(Box::new(DeviceReader { rx: device_rx }), &assembler_engine);
    });

    Harness {
        engine,
        written_rx,
        device_tx,
        fail,
    }
}

impl Harness {
    fn expect_write(&self) -> Vec<u8> {
        self.written_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("link write did not happen")
    }

    fn expect_no_write(&self, within: Duration) {
        assert!(
            self.written_rx.recv_timeout(within).is_err(),
            "unexpected link write"
        );
    }

    fn device_send(&self, bytes: &[u8]) {
        self.device_tx.send(bytes.to_vec()).unwrap();
    }
}

#[test]
fn test_single_request_round_trip_and_cache_ttl_floor() {
    let h = start_harness();

    let handle = h.engine.submit("c1", &[0x68, 0x03, 0x03]);
    assert_eq!(h.expect_write(), vec![0x68, 0x03, 0x03]);

    // Device answers in two chunks inside the quiet window.
    thread::sleep(Duration::from_millis(10));
    h.device_send(&[0xAA]);
    thread::sleep(Duration::from_millis(20));
    h.device_send(&[0xBB]);

    assert_eq!(
        handle.wait_timeout(Duration::from_secs(1)).as_deref(),
        Some([0xAA, 0xBB].as_slice())
    );

    // A fast round trip clamps the cache TTL to its 1 s floor: an immediate
    // repeat is a cache hit, a repeat after expiry hits the link again.
    let hit = h.engine.submit("c2", &[0x68, 0x03, 0x03]);
    assert_eq!(
        hit.wait_timeout(Duration::from_millis(200)).as_deref(),
        Some([0xAA, 0xBB].as_slice())
    );
    h.expect_no_write(Duration::from_millis(100));

    thread::sleep(Duration::from_millis(1100));
    let miss = h.engine.submit("c3", &[0x68, 0x03, 0x03]);
    assert_eq!(h.expect_write(), vec![0x68, 0x03, 0x03]);
    h.device_send(&[0xAA, 0xBB]);
    assert_eq!(
        miss.wait_timeout(Duration::from_secs(1)).as_deref(),
        Some([0xAA, 0xBB].as_slice())
    );
}

#[test]
fn test_dedup_then_cache_hit() {
    let h = start_harness();

    let first = h.engine.submit("c1", &[0x01, 0x02]);
    assert_eq!(h.expect_write(), vec![0x01, 0x02]);
    thread::sleep(Duration::from_millis(5));
    let second = h.engine.submit("c2", &[0x01, 0x02]);

    h.device_send(&[0xFF]);

    assert_eq!(
        first.wait_timeout(Duration::from_secs(1)).as_deref(),
        Some([0xFF].as_slice())
    );
    assert_eq!(
        second.wait_timeout(Duration::from_secs(1)).as_deref(),
        Some([0xFF].as_slice())
    );
    // The device saw exactly one write for both clients.
    h.expect_no_write(Duration::from_millis(100));

    // And a third client inside the TTL is served synchronously from cache.
    let third = h.engine.submit("c3", &[0x01, 0x02]);
    assert_eq!(third.wait().as_deref(), Some([0xFF].as_slice()));
    h.expect_no_write(Duration::from_millis(100));
}

#[test]
fn test_timeout_then_drop_window_then_recovery() {
    let h = start_harness();

    let start = Instant::now();
    let handle = h.engine.submit("c1", &[0xAA]);
    assert_eq!(h.expect_write(), vec![0xAA]);

    // Device stays silent; the reaper fails the request within one tick of
    // the timeout.
    assert_eq!(
        handle.wait_timeout(REQUEST_TIMEOUT + REAP_TICK + Duration::from_secs(1)),
        None
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= REQUEST_TIMEOUT, "completed too early: {elapsed:?}");
    assert!(
        elapsed <= REQUEST_TIMEOUT + REAP_TICK + Duration::from_millis(400),
        "completed too late: {elapsed:?}"
    );

    // Late bytes from the dead request are discarded.
    h.device_send(&[0xEE]);
    thread::sleep(Duration::from_millis(100));

    // The engine keeps serving.
    let next = h.engine.submit("c2", &[0xBB]);
    assert_eq!(h.expect_write(), vec![0xBB]);
    h.device_send(&[0x42]);
    assert_eq!(
        next.wait_timeout(Duration::from_secs(1)).as_deref(),
        Some([0x42].as_slice())
    );
}

#[test]
fn test_write_failure_then_recovery() {
    let h = start_harness();

    h.fail.store(true, Ordering::SeqCst);
    let failed = h.engine.submit("c1", &[0x11]);
    assert_eq!(failed.wait_timeout(Duration::from_secs(1)), None);

    h.fail.store(false, Ordering::SeqCst);
    let ok = h.engine.submit("c2", &[0x22]);
    assert_eq!(h.expect_write(), vec![0x22]);
    h.device_send(&[0x99]);
    assert_eq!(
        ok.wait_timeout(Duration::from_secs(1)).as_deref(),
        Some([0x99].as_slice())
    );
}

#[test]
fn test_head_timeout_promotes_queued_request() {
    let h = start_harness();

    let first = h.engine.submit("c1", &[0x01]);
    assert_eq!(h.expect_write(), vec![0x01]);

    // Enqueue the second request late enough that it is still fresh when
    // the stalled head gets reaped.
    thread::sleep(Duration::from_millis(1500));
    let second = h.engine.submit("c2", &[0x02]);
    h.expect_no_write(Duration::from_millis(100));

    assert_eq!(first.wait_timeout(Duration::from_secs(5)), None);

    // The reaper promoted the second request; only c2 sees its response.
    assert_eq!(h.expect_write(), vec![0x02]);
    h.device_send(&[0x77]);
    assert_eq!(
        second.wait_timeout(Duration::from_secs(2)).as_deref(),
        Some([0x77].as_slice())
    );
}

/// Deterministic device transform used by the randomized trace.
fn device_reply(request: &[u8]) -> Vec<u8> {
    request.iter().map(|b| b ^ 0x5A).collect()
}

#[test]
fn test_randomized_submissions_all_complete_with_correct_bytes() {
    let (written_tx, written_rx) = mpsc::channel::<Vec<u8>>();
    let (device_tx, device_rx) = mpsc::channel();
    let fail = Arc::new(AtomicBool::new(false));

    let engine = Engine::start(Box::new(DeviceWriter {
        written_tx,
        fail,
    }));
    let assembler_engine = engine.clone();
    thread::spawn(move || {
        run_frame_assembler(Box::new(DeviceReader { rx: device_rx }), &assembler_engine);
    });

    // Auto-responder: every write gets its transform back after a small
    // random think time.
    thread::spawn(move || {
        let mut rng = rand::thread_rng();
        while let Ok(request) = written_rx.recv() {
            thread::sleep(Duration::from_millis(rng.gen_range(0..15)));
            if device_tx.send(device_reply(&request)).is_err() {
                break;
            }
        }
    });

    const PAYLOADS: [&[u8]; 6] = [
        &[0x68, 0x03, 0x03],
        &[0x01, 0x02],
        &[0xAA],
        &[0xDE, 0xAD, 0xBE, 0xEF],
        &[0x00],
        &[0x7F, 0x7F],
    ];

    let mut submitters = Vec::new();
    for worker in 0..4usize {
        let engine = engine.clone();
        submitters.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let mut pending = Vec::new();
            for i in 0..20 {
                let payload = PAYLOADS[(worker + i) % PAYLOADS.len()];
                pending.push((payload, engine.submit(&format!("client-{worker}"), payload)));
                thread::sleep(Duration::from_millis(rng.gen_range(0..20)));
            }
            for (payload, handle) in pending {
                let outcome = handle.wait_timeout(REQUEST_TIMEOUT + REAP_TICK + Duration::from_secs(1));
                assert_eq!(
                    outcome.as_deref(),
                    Some(device_reply(payload).as_slice()),
                    "wrong outcome for {payload:?}"
                );
            }
        }));
    }

    for submitter in submitters {
        submitter.join().unwrap();
    }
    engine.shutdown();
}
