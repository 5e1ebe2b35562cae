//! Per-device dispatch core for ttyhub.
//!
//! One [`Engine`] owns one half-duplex device link and serializes requests
//! from any number of concurrent network clients onto it:
//! - Intake fingerprints each submission, answers repeats from the response
//!   cache, and folds duplicates of the in-flight command into a waiter list
//! - A writer task moves the queue head through idle → sending → waiting
//! - A frame assembler turns device bytes into one frame per quiet gap
//! - A reaper reclaims stalled requests and expired cache entries
//!
//! The engine never interprets payload bytes; identity is the 64-bit
//! fingerprint of the raw request, and response framing is purely temporal.

pub mod cache;
pub mod completion;
pub mod engine;
pub mod fingerprint;
pub mod frame;
pub mod issue_log;
pub mod link;

pub use cache::ResponseCache;
pub use completion::CompletionHandle;
pub use engine::{Engine, LinkState, PayloadBuf};
pub use fingerprint::fingerprint;
pub use frame::run_frame_assembler;
pub use link::{LinkReader, LinkWriter};

use std::time::Duration;

/// Inter-byte silence that ends a device response frame.
pub const FRAME_QUIET: Duration = Duration::from_millis(50);

/// Maximum time a request may wait, from enqueue-or-send to completion.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Lower clamp on the adaptive cache TTL.
pub const CACHE_TTL_MIN: Duration = Duration::from_secs(1);

/// Upper clamp on the adaptive cache TTL.
pub const CACHE_TTL_MAX: Duration = Duration::from_secs(30);

/// Window after a reap or failed write during which ownerless device bytes
/// are discarded as late responses. Chosen empirically.
pub const DROP_WINDOW: Duration = Duration::from_millis(150);

/// Reaper cadence.
pub const REAP_TICK: Duration = Duration::from_secs(1);
