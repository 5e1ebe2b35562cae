//! Single-shot completion plumbing between the engine and its clients.
//!
//! Every accepted request carries a [`CompletionSlot`]; the submitter gets
//! the matching [`CompletionHandle`]. The slot resolves exactly once, with
//! either response bytes or the no-response outcome. No response is
//! signalled by dropping the sender, so the receiver simply observes a
//! closed channel.

use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;

/// Receiving side of a request outcome, handed back by `Engine::submit`.
///
/// Waiting consumes the handle, so an outcome can only be taken once.
pub struct CompletionHandle {
    rx: oneshot::Receiver<Bytes>,
}

impl CompletionHandle {
    /// Block until the outcome arrives. `None` means no response (timeout,
    /// link failure, or engine shutdown).
    #[must_use]
    pub fn wait(self) -> Option<Bytes> {
        self.rx.recv().ok()
    }

    /// Like [`CompletionHandle::wait`] with an upper bound on the wait.
    #[must_use]
    pub fn wait_timeout(self, timeout: Duration) -> Option<Bytes> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Engine-owned sending side. The sender is taken out of the slot on the
/// first delivery, which makes the first-writer-wins decision atomic: a
/// concurrent reap and frame completion cannot both deliver.
pub(crate) struct CompletionSlot {
    tx: Mutex<Option<oneshot::Sender<Bytes>>>,
}

impl CompletionSlot {
    pub(crate) fn new() -> (CompletionSlot, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        let slot = CompletionSlot {
            tx: Mutex::new(Some(tx)),
        };
        (slot, CompletionHandle { rx })
    }

    /// Resolve with response bytes. No-op if already resolved.
    pub(crate) fn deliver(&self, data: Bytes) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            // The handle may already be dropped; that is the client's choice.
            let _ = tx.send(data);
        }
    }

    /// Resolve with the no-response outcome. No-op if already resolved.
    pub(crate) fn deliver_empty(&self) {
        drop(self.tx.lock().unwrap().take());
    }

    /// A handle that is already resolved with `data` (cache hits).
    pub(crate) fn ready(data: Bytes) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(data);
        CompletionHandle { rx }
    }

    /// A handle that is already resolved as no-response (rejected intake).
    pub(crate) fn closed() -> CompletionHandle {
        let (tx, rx) = oneshot::channel::<Bytes>();
        drop(tx);
        CompletionHandle { rx }
    }
}
