//! The per-device dispatch engine.
//!
//! The queue head is the unique owner of the link. Intake either answers
//! from cache, attaches a duplicate submission as a waiter on the in-flight
//! command with the same fingerprint, or appends a new queue entry. A
//! writer task moves the head through idle → sending → waiting; the frame
//! assembler hands back one response frame per quiet gap; a reaper fails
//! stalled requests and reopens the link when the head was among them.
//!
//! One mutex protects the queue, both side tables, `current_req_id` and the
//! drop window. Device I/O always happens outside it.

use crate::cache::ResponseCache;
use crate::completion::{CompletionHandle, CompletionSlot};
use crate::fingerprint::fingerprint;
use crate::issue_log::{issue, issue_throttled};
use crate::link::LinkWriter;
use crate::{CACHE_TTL_MAX, CACHE_TTL_MIN, DROP_WINDOW, REAP_TICK, REQUEST_TIMEOUT};

use bytes::Bytes;
use indexmap::IndexMap;
use log::{debug, info};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Instant;

/// Inline buffer for request payloads; most serial commands are short.
pub type PayloadBuf = SmallVec<[u8; 16]>;

/// Link ownership states. Stored in an `AtomicU8` so frame arrival can run
/// its quick discard check without the engine lock; transitions only
/// happen while the lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    /// No request owns the link.
    Idle = 0,
    /// The head's bytes are being written; no response is expected yet.
    Sending = 1,
    /// The head's bytes are on the wire; device bytes belong to it.
    Waiting = 2,
}

impl LinkState {
    fn from_u8(v: u8) -> LinkState {
        match v {
            1 => LinkState::Sending,
            2 => LinkState::Waiting,
            _ => LinkState::Idle,
        }
    }
}

struct Request {
    /// Queue identity, assigned at acceptance. 0 for waiters, which never
    /// own the link.
    id: u64,
    client_id: String,
    fingerprint: u64,
    payload: PayloadBuf,
    completion: CompletionSlot,
    enqueued_at: Instant,
    /// Set under the engine lock once the link write has completed.
    sent_at: Mutex<Option<Instant>>,
}

impl Request {
    fn finish_with(&self, data: Bytes) {
        self.completion.deliver(data);
    }

    fn finish_empty(&self) {
        self.completion.deliver_empty();
    }
}

enum WriterCommand {
    Attempt(Arc<Request>),
    Stop,
}

struct EngineInner {
    /// FIFO of unique in-flight commands; the head owns the link.
    queue: VecDeque<Arc<Request>>,
    /// fingerprint → queued main, so duplicates can attach as waiters.
    inflight: IndexMap<u64, Arc<Request>>,
    /// fingerprint → followers completed by the main's outcome. Waiters
    /// stay out of the queue so they can never be promoted to head.
    waiters: IndexMap<u64, Vec<Arc<Request>>>,
    /// Id of the request whose response is currently expected; 0 when idle.
    current_req_id: u64,
    /// While set and in the future, ownerless device bytes are discarded.
    drop_until: Option<Instant>,
}

impl EngineInner {
    fn head(&self) -> Option<&Arc<Request>> {
        self.queue.front()
    }

    fn in_drop_window(&self, now: Instant) -> bool {
        self.drop_until.is_some_and(|until| now < until)
    }
}

pub struct Engine {
    inner: Mutex<EngineInner>,
    cache: ResponseCache,
    state: AtomicU8,
    next_req_id: AtomicU64,
    shut_down: AtomicBool,
    writer_tx: Sender<WriterCommand>,
    reaper_stop_tx: Sender<()>,
}

impl Engine {
    /// Create an engine over the link's write half and spawn its writer and
    /// reaper tasks. The caller drives the read half through
    /// [`crate::run_frame_assembler`] on its own thread.
    pub fn start(link: Box<dyn LinkWriter>) -> Arc<Engine> {
        let (writer_tx, writer_rx) = mpsc::channel();
        let (reaper_stop_tx, reaper_stop_rx) = mpsc::channel();

        let engine = Arc::new(Engine {
            inner: Mutex::new(EngineInner {
                queue: VecDeque::new(),
                inflight: IndexMap::new(),
                waiters: IndexMap::new(),
                current_req_id: 0,
                drop_until: None,
            }),
            cache: ResponseCache::new(),
            state: AtomicU8::new(LinkState::Idle as u8),
            next_req_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            writer_tx,
            reaper_stop_tx,
        });

        // Background tasks hold only a weak reference, so an engine that is
        // dropped without an explicit shutdown still unwinds.
        let weak = Arc::downgrade(&engine);
        thread::Builder::new()
            .name("ttyhub-writer".into())
            .spawn(move || writer_task(&weak, &writer_rx, link))
            .expect("failed to spawn writer task");

        let weak = Arc::downgrade(&engine);
        thread::Builder::new()
            .name("ttyhub-reaper".into())
            .spawn(move || reaper_task(&weak, &reaper_stop_rx))
            .expect("failed to spawn reaper task");

        engine
    }

    /// Accept one client command and return its completion handle.
    ///
    /// Never blocks on device I/O: the handle is immediately resolved on a
    /// cache hit or when the engine is shut down, attached as a waiter when
    /// an identical command is already in flight, and queued otherwise.
    pub fn submit(&self, client_id: &str, payload: &[u8]) -> CompletionHandle {
        if self.shut_down.load(Ordering::SeqCst) {
            return CompletionSlot::closed();
        }

        let fp = fingerprint(payload);
        if let Some(hit) = self.cache.get(fp) {
            return CompletionSlot::ready(hit);
        }

        let (slot, handle) = CompletionSlot::new();

        let mut inner = self.inner.lock().unwrap();

        // Re-check under the lock: a concurrent completion may have cached
        // this fingerprint between the lookup above and here.
        if let Some(hit) = self.cache.get(fp) {
            drop(inner);
            slot.deliver(hit);
            return handle;
        }

        let now = Instant::now();

        if inner.inflight.contains_key(&fp) {
            let waiter = Arc::new(Request {
                id: 0,
                client_id: client_id.to_string(),
                fingerprint: fp,
                payload: PayloadBuf::from_slice(payload),
                completion: slot,
                enqueued_at: now,
                sent_at: Mutex::new(None),
            });
            inner.waiters.entry(fp).or_default().push(waiter);
            return handle;
        }

        let id = self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1;
        let req = Arc::new(Request {
            id,
            client_id: client_id.to_string(),
            fingerprint: fp,
            payload: PayloadBuf::from_slice(payload),
            completion: slot,
            enqueued_at: now,
            sent_at: Mutex::new(None),
        });
        inner.inflight.insert(fp, req.clone());
        inner.queue.push_back(req.clone());

        let promote = inner.queue.len() == 1 && self.state() == LinkState::Idle;
        drop(inner);

        if promote {
            self.schedule_write(req);
        }
        handle
    }

    /// Hand one assembled response frame to the engine. The frame belongs
    /// to the queue head or to nobody.
    pub fn on_frame(&self, data: &[u8]) {
        // Quick check without the lock; the authoritative checks below run
        // under it and a stale pass here is caught by the owner checks.
        let state = self.state();
        if state != LinkState::Waiting {
            issue_throttled("drop_state", || {
                format!("drop rx: state={state:?} bytes={}", data.len())
            });
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let Some(head) = inner.head().cloned() else {
            if inner.in_drop_window(now) {
                issue_throttled("drop_until", || {
                    format!("drop rx: late response bytes={}", data.len())
                });
            } else {
                issue_throttled("drop_no_pending", || {
                    format!("drop rx: no pending request bytes={}", data.len())
                });
            }
            return;
        };

        if head.id != inner.current_req_id {
            if inner.in_drop_window(now) {
                issue_throttled("drop_until", || {
                    format!("drop rx: late response bytes={}", data.len())
                });
            } else {
                let current = inner.current_req_id;
                issue_throttled("drop_id_mismatch", || {
                    format!(
                        "drop rx: current_id={current} head_id={} bytes={}",
                        head.id,
                        data.len()
                    )
                });
            }
            return;
        }

        let sent_at = *head.sent_at.lock().unwrap();
        let Some(sent_at) = sent_at else {
            if inner.in_drop_window(now) {
                issue_throttled("drop_until", || {
                    format!("drop rx: late response bytes={}", data.len())
                });
            } else {
                issue_throttled("drop_unsent", || {
                    format!("drop rx: req_id={} not sent bytes={}", head.id, data.len())
                });
            }
            return;
        };

        // The frame belongs to the head. Cache it with a TTL derived from
        // the observed round trip, then complete the head and its waiters.
        let rtt = now.saturating_duration_since(sent_at);
        let ttl = (rtt * 2).clamp(CACHE_TTL_MIN, CACHE_TTL_MAX);
        let response = Bytes::copy_from_slice(data);
        self.cache.put(head.fingerprint, response.clone(), ttl);

        let waiters = inner.waiters.swap_remove(&head.fingerprint).unwrap_or_default();
        inner.inflight.swap_remove(&head.fingerprint);
        inner.queue.pop_front();
        inner.current_req_id = 0;
        self.state.store(LinkState::Idle as u8, Ordering::SeqCst);
        let next = inner.head().cloned();
        drop(inner);

        debug!(
            "response: req_id={} client={} bytes={} rtt={}ms ttl={}ms waiters={}",
            head.id,
            head.client_id,
            response.len(),
            rtt.as_millis(),
            ttl.as_millis(),
            waiters.len()
        );

        head.finish_with(response.clone());
        for waiter in &waiters {
            waiter.finish_with(response.clone());
        }
        if let Some(next) = next {
            self.schedule_write(next);
        }
    }

    /// Stop the engine: fail everything pending, refuse further intake and
    /// stop the writer and reaper tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let queue = std::mem::take(&mut inner.queue);
        let waiters = std::mem::take(&mut inner.waiters);
        inner.inflight.clear();
        inner.current_req_id = 0;
        self.state.store(LinkState::Idle as u8, Ordering::SeqCst);
        drop(inner);

        let _ = self.writer_tx.send(WriterCommand::Stop);
        let _ = self.reaper_stop_tx.send(());

        let mut failed = 0usize;
        for req in &queue {
            req.finish_empty();
            failed += 1;
        }
        for (_, list) in &waiters {
            for waiter in list {
                waiter.finish_empty();
                failed += 1;
            }
        }
        info!("engine shut down, {failed} pending requests failed");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Current link ownership state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn schedule_write(&self, req: Arc<Request>) {
        // Failure means the writer task is gone; anything queued behind it
        // is reclaimed by the reaper.
        let _ = self.writer_tx.send(WriterCommand::Attempt(req));
    }

    /// Move the candidate through idle → sending → waiting. The candidate
    /// must still be the queue head with the link idle; otherwise another
    /// path (completion or reap) already owns the transition and the
    /// attempt is a no-op.
    fn write_attempt(&self, link: &mut dyn LinkWriter, req: &Arc<Request>) {
        {
            let inner = self.inner.lock().unwrap();
            match inner.head() {
                Some(head) if Arc::ptr_eq(head, req) => {}
                _ => return,
            }
            if self.state() != LinkState::Idle {
                return;
            }
            self.state.store(LinkState::Sending as u8, Ordering::SeqCst);
        }

        // The device write happens outside the lock.
        let result = link.write_all(&req.payload);

        let mut inner = self.inner.lock().unwrap();

        // Reaped while the write was in flight: the reaper owns the state
        // transition and the outcome, so the write result is discarded.
        match inner.head() {
            Some(head) if Arc::ptr_eq(head, req) => {}
            _ => return,
        }

        match result {
            Ok(()) => {
                *req.sent_at.lock().unwrap() = Some(Instant::now());
                inner.current_req_id = req.id;
                self.state.store(LinkState::Waiting as u8, Ordering::SeqCst);
            }
            Err(e) => {
                inner.queue.pop_front();
                inner.inflight.swap_remove(&req.fingerprint);
                let waiters = inner.waiters.swap_remove(&req.fingerprint).unwrap_or_default();
                inner.current_req_id = 0;
                self.state.store(LinkState::Idle as u8, Ordering::SeqCst);
                // Late bytes from the device may still arrive for a write
                // the device partially saw; absorb them.
                inner.drop_until = Some(Instant::now() + DROP_WINDOW);
                let next = inner.head().cloned();
                drop(inner);

                issue(&format!(
                    "write_failed: req_id={} client={} fingerprint={:016x} err={e}",
                    req.id, req.client_id, req.fingerprint
                ));

                req.finish_empty();
                for waiter in &waiters {
                    waiter.finish_empty();
                }
                if let Some(next) = next {
                    self.schedule_write(next);
                }
            }
        }
    }

    /// One reaper tick: sweep the cache, fail every stalled request and
    /// reopen the link if the head was among them.
    fn reap(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.cache.sweep();

        let now = Instant::now();
        let mut expired: Vec<Arc<Request>> = Vec::new();
        let mut head_expired = false;

        // A sent request times out from its send; an unsent one from its
        // acceptance.
        let queue = std::mem::take(&mut inner.queue);
        for (idx, req) in queue.into_iter().enumerate() {
            let base = req.sent_at.lock().unwrap().unwrap_or(req.enqueued_at);
            if now.duration_since(base) < REQUEST_TIMEOUT {
                inner.queue.push_back(req);
                continue;
            }
            if idx == 0 {
                head_expired = true;
            }
            inner.inflight.swap_remove(&req.fingerprint);
            let waiters = inner.waiters.swap_remove(&req.fingerprint).unwrap_or_default();
            expired.push(req);
            expired.extend(waiters);
        }

        // Waiters can outlive their main (attached after it was enqueued)
        // or be orphaned; age them out on their own enqueue time.
        inner.waiters.retain(|_, list| {
            list.retain(|waiter| {
                if now.duration_since(waiter.enqueued_at) < REQUEST_TIMEOUT {
                    true
                } else {
                    expired.push(waiter.clone());
                    false
                }
            });
            !list.is_empty()
        });

        let mut next = None;
        if head_expired {
            inner.current_req_id = 0;
            self.state.store(LinkState::Idle as u8, Ordering::SeqCst);
            inner.drop_until = Some(now + DROP_WINDOW);
            next = inner.head().cloned();
        }
        drop(inner);

        for req in &expired {
            issue(&format!(
                "request_timeout: req_id={} client={} fingerprint={:016x}",
                req.id, req.client_id, req.fingerprint
            ));
            req.finish_empty();
        }
        if let Some(next) = next {
            self.schedule_write(next);
        }
    }

    #[cfg(test)]
    fn current_req_id(&self) -> u64 {
        self.inner.lock().unwrap().current_req_id
    }

    #[cfg(test)]
    fn table_sizes(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        let waiter_count = inner.waiters.values().map(Vec::len).sum();
        (inner.queue.len(), inner.inflight.len(), waiter_count)
    }
}

fn writer_task(engine: &Weak<Engine>, rx: &Receiver<WriterCommand>, mut link: Box<dyn LinkWriter>) {
    debug!("writer task started");
    while let Ok(WriterCommand::Attempt(req)) = rx.recv() {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.write_attempt(link.as_mut(), &req);
    }
    debug!("writer task stopped");
}

fn reaper_task(engine: &Weak<Engine>, stop_rx: &Receiver<()>) {
    debug!("reaper task started");
    loop {
        match stop_rx.recv_timeout(REAP_TICK) {
            Err(RecvTimeoutError::Timeout) => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.reap();
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("reaper task stopped");
}
