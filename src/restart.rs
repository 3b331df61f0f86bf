//! Restart Signal
//!
//! The process-restart half of the reload/restart contract. Hot reload goes
//! through the capability registry; a full restart is requested here and
//! observed by `main`, which exits with a distinguished status so the
//! external supervisor relaunches the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Exit status meaning "please relaunch me"
pub const RESTART_EXIT_CODE: i32 = 42;

/// Shared flag a tool can raise to request a full process restart
pub struct RestartSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl RestartSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Ask for a full restart. Idempotent.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        info!("Full restart requested (exit code {})", RESTART_EXIT_CODE);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once a restart has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}
