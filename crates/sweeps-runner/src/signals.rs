//! Translates SIGINT/SIGTERM/SIGQUIT into a cancellation request.
//!
//! The signals are blocked on the calling thread, and therefore on every
//! thread it spawns afterwards, then awaited synchronously on a dedicated
//! thread. No handler runs in async-signal context.

use anyhow::Result;
use nix::sys::signal::{SigSet, Signal};
use std::thread;

use crate::cancel::CancellationToken;

pub struct SignalAdapter;

impl SignalAdapter {
    /// Must run before the worker pool is spawned so workers inherit the mask.
    pub fn install(token: CancellationToken) -> Result<()> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        set.add(Signal::SIGTERM);
        set.add(Signal::SIGQUIT);
        set.thread_block()?;
        thread::Builder::new()
            .name("sweep-signals".to_string())
            .spawn(move || loop {
                match set.wait() {
                    Ok(signal) => {
                        if signal == Signal::SIGINT {
                            eprintln!("\nSweep interrupted: terminating processes.");
                        } else {
                            eprintln!(
                                "Sweep received external signal {}: terminating processes.",
                                signal as i32
                            );
                        }
                        tracing::warn!(signal = signal as i32, "cancellation requested");
                        token.cancel(signal as i32);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "signal wait failed");
                        break;
                    }
                }
            })?;
        Ok(())
    }
}
