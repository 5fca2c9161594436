//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is shared by every component (HTTP server, consumer
//! loops). Once triggered, by an OS signal or programmatically, it stays
//! triggered: late subscribers and [`ShutdownSignal::is_shutdown`] observe it.
//!
//! # Example
//!
//! ```rust,ignore
//! use chatstream::shutdown::ShutdownSignal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = ShutdownSignal::new();
//!
//!     // Clone for each component
//!     let worker_shutdown = shutdown.clone();
//!
//!     tokio::spawn(async move {
//!         loop {
//!             tokio::select! {
//!                 _ = worker_shutdown.recv() => break,
//!                 // ... process entries
//!             }
//!         }
//!     });
//!
//!     // Wait for SIGTERM / Ctrl+C
//!     shutdown.wait().await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A latch for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    /// Grace period components get to finish after the signal
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
        }
    }

    /// Get the shutdown timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM or SIGINT, then trigger shutdown.
    ///
    /// Also returns early if shutdown was triggered some other way.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.recv() => return,
        }

        self.sender.send_replace(true);
    }

    /// Subscribe to shutdown notifications.
    ///
    /// The receiver's value flips to `true` once shutdown is triggered.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Resolve once shutdown has been triggered (immediately if it already was).
    pub async fn recv(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only returns on `true`.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    /// Non-blocking check whether shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.sender.send_replace(true);
    }

    /// Wait for shutdown with a timeout.
    ///
    /// Returns `true` if shutdown was triggered within timeout, `false` if timed out.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.recv() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout reached, forcing shutdown"
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
