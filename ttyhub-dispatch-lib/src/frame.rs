//! Device → engine frame assembly.
//!
//! One blocking loop owns the link's read half. Bytes accumulate until the
//! link's native read timeout reports a quiet gap, at which point the
//! accumulator is emitted as a single frame. The engine therefore never
//! sees partial frames, and there is no shared timer to reset or drain.

use crate::engine::Engine;
use crate::link::LinkReader;
use log::error;
use std::io::ErrorKind;
use std::sync::Arc;

const SCRATCH_LEN: usize = 4096;

/// Run the frame assembly loop until the engine shuts down or the link
/// read fails. Call from a dedicated thread.
pub fn run_frame_assembler(mut reader: Box<dyn LinkReader>, engine: &Arc<Engine>) {
    let mut scratch = [0u8; SCRATCH_LEN];
    let mut frame: Vec<u8> = Vec::new();

    loop {
        if engine.is_shutdown() {
            return;
        }

        match reader.read(&mut scratch) {
            Ok(n) if n > 0 => frame.extend_from_slice(&scratch[..n]),
            Ok(_) => {
                // Zero-length read: the device side of the link is gone.
                if !engine.is_shutdown() {
                    error!("device link closed, halting engine");
                }
                engine.shutdown();
                return;
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                if !frame.is_empty() {
                    engine.on_frame(&frame);
                    frame.clear();
                }
            }
            Err(e) => {
                if !engine.is_shutdown() {
                    error!("device read failed, halting engine: {e}");
                }
                engine.shutdown();
                return;
            }
        }
    }
}
