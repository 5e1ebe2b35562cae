//! Anomaly event logging with per-tag throttling.
//!
//! Issue events describe dropped frames, failed writes and reaped requests.
//! They are operational signals, never propagated as errors, and go to the
//! dedicated `ttyhub::issue` log target so deployments can route them to
//! their own sink. The throttled variant logs a given tag at most once per
//! second, since a chattering device can repeat the same drop cause at
//! byte rate.

use log::warn;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

/// Log target for anomaly events.
pub const ISSUE_TARGET: &str = "ttyhub::issue";

const THROTTLE_GAP: Duration = Duration::from_secs(1);

static LAST_BY_TAG: LazyLock<Mutex<HashMap<&'static str, Instant>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Log an issue event unconditionally.
pub fn issue(msg: &str) {
    warn!(target: ISSUE_TARGET, "{msg}");
}

/// Log an issue event unless the same tag fired within the last second.
/// The message is only rendered when it will actually be logged.
pub fn issue_throttled(tag: &'static str, msg: impl FnOnce() -> String) {
    if !admit(tag, Instant::now()) {
        return;
    }
    warn!(target: ISSUE_TARGET, "{tag}: {}", msg());
}

fn admit(tag: &'static str, now: Instant) -> bool {
    let mut last = LAST_BY_TAG.lock().unwrap();
    if let Some(prev) = last.get(tag) {
        if now.duration_since(*prev) < THROTTLE_GAP {
            return false;
        }
    }
    last.insert(tag, now);
    true
}
