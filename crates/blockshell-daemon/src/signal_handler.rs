//! SIGINT/SIGTERM handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing::info;

use crate::error::DaemonError;

/// Sets the shared shutdown flag on the first SIGINT or SIGTERM. Dropping the
/// handler unregisters the signals and joins its thread.
pub struct SignalHandler {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalHandler {
    pub fn setup(shutdown: Arc<AtomicBool>) -> Result<Self, DaemonError> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!(signal = sig, "Received signal, initiating graceful shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                }
            })
            .map_err(|e| {
                DaemonError::SignalSetup(format!("failed to spawn signal handler: {}", e))
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
