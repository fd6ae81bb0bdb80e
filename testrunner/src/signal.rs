//! Interrupt handling.
//!
//! `ShutdownFlag` is set by Ctrl+C and shared by the dispatch loop and every
//! worker. Workers wait on `cancelled()` alongside their child process so an
//! interrupt kills in-flight applications promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Flag that tracks whether an interrupt has been requested.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    /// Create a flag and register the Ctrl+C handler.
    ///
    /// If the handler cannot be registered (already registered), the flag
    /// is still valid and can be triggered manually.
    pub fn new() -> Self {
        let shutdown = Self::manual();
        let handler = shutdown.clone();

        if let Err(e) = ctrlc::set_handler(move || handler.trigger()) {
            log::debug!("Interrupt handler not installed: {}", e);
        }

        shutdown
    }

    /// Create a flag without registering a handler.
    pub fn manual() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    /// Request shutdown and wake every waiter.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns true if shutdown has been requested.
    pub fn should_stop(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a trigger in between is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.should_stop() {
                return;
            }
            notified.await;
        }
    }
}
