//! Graceful Shutdown Handling
//!
//! This module provides utilities for handling graceful shutdown of the telemetry server.
//! It supports SIGTERM and SIGINT signals and gives running tasks a bounded time to finish.

use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Cancelled once shutdown starts; every long-running task holds a clone
    token: CancellationToken,
    /// Shutdown timeout duration
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Token for components to listen for shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start shutdown without waiting for a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for SIGTERM, SIGINT, or Ctrl+C, then cancel the token.
    ///
    /// Returns early if shutdown was triggered some other way.
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => {
                    debug!("Shutdown triggered internally");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => {
                    debug!("Shutdown triggered internally");
                }
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Wait for tasks to finish, aborting any still running at the timeout
    pub async fn wait_for_tasks<T>(&self, tasks: Vec<(&'static str, JoinHandle<T>)>) {
        let deadline = Instant::now() + self.timeout;

        for (name, mut handle) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(_)) => debug!("Task {} completed", name),
                Ok(Err(e)) if e.is_cancelled() => debug!("Task {} was cancelled", name),
                Ok(Err(e)) => error!("Task {} failed: {}", name, e),
                Err(_) => {
                    warn!("Task {} did not stop within {:?}, aborting", name, self.timeout);
                    handle.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_trigger_cancels_token() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let token = coordinator.token();

        assert!(!coordinator.is_shutting_down());
        coordinator.trigger();

        assert!(token.is_cancelled());
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_listener_returns_after_internal_trigger() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.trigger();

        assert!(coordinator.listen_for_signals().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_tasks_completes_cooperative_tasks() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let token = coordinator.token();

        let task = tokio::spawn(async move {
            token.cancelled().await;
            7u32
        });

        coordinator.trigger();
        coordinator.wait_for_tasks(vec![("cooperative", task)]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tasks_aborts_stuck_tasks() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));

        let stuck = tokio::spawn(async {
            sleep(Duration::from_secs(3600)).await;
        });
        let abort_handle = stuck.abort_handle();

        let started = Instant::now();
        coordinator.wait_for_tasks(vec![("stuck", stuck)]).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        for _ in 0..10 {
            if abort_handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort_handle.is_finished());
    }
}
