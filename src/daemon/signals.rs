//! Signal handling: SIGTERM/SIGINT request a graceful shutdown of the
//! Supervisor Loop. Uses the `signal-hook` crate for safe registration; the
//! main loop polls the flag once per tick rather than blocking on signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Thread-safe shutdown flag shared between the signal handler and the main
/// loop. `Ordering::Relaxed` is sufficient since the loop polls once per
/// tick and no other atomic ordering is involved.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Register SIGTERM/SIGINT. Registration is best-effort; failures are
    /// logged to stderr but are not fatal (the daemon still responds to a
    /// `control.json` stop request, just not to an OS signal).
    #[must_use]
    pub fn new() -> Self {
        let handler = Self { shutdown_flag: Arc::new(AtomicBool::new(false)) };
        handler.register_signals();
        handler
    }

    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[SHEP-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[SHEP-SIGNAL] failed to register SIGINT: {e}");
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shutdown_is_observed() {
        let handler = SignalHandler { shutdown_flag: Arc::new(AtomicBool::new(false)) };
        assert!(!handler.should_shutdown());
        handler.request_shutdown();
        assert!(handler.should_shutdown());
    }
}
