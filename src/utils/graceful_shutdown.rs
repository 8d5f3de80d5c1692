//! Process shutdown: SIGINT/SIGTERM cancel one token, the server drains
//! within a deadline, then every registered connection pool is closed.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::{signal, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::adapters::ConnectionManager;

/// How draining ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Everything finished within the deadline
    Graceful,
    /// The deadline passed first
    Force,
}

pub struct GracefulShutdown {
    token: CancellationToken,
    drain_timeout: Duration,
    pools: Mutex<Vec<Arc<ConnectionManager>>>,
}

impl GracefulShutdown {
    /// Drain deadline of 30 seconds.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
            pools: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled as soon as shutdown starts; background loops watch it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Close this pool's connections once serving has stopped.
    pub fn register_pool(&self, pool: Arc<ConnectionManager>) {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pool);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Start shutting down. Later calls are no-ops.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown initiated");
            self.token.cancel();
        }
    }

    /// Wait for SIGINT or SIGTERM, then start shutting down.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for SIGINT")?;
                tracing::info!("Received SIGINT");
            }
            result = wait_for_sigterm() => {
                result?;
                tracing::info!("Received SIGTERM");
            }
            _ = self.token.cancelled() => return Ok(()),
        }
        self.shutdown();
        Ok(())
    }

    /// Resolves once shutdown has started.
    pub async fn wait_for_shutdown_signal(&self) {
        self.token.cancelled().await;
    }

    /// Wait for `drain` (usually the server future) for at most the drain
    /// timeout, then close every registered pool.
    pub async fn drain<F: std::future::Future>(&self, drain: F) -> ShutdownReason {
        let reason = match timeout(self.drain_timeout, drain).await {
            Ok(_) => ShutdownReason::Graceful,
            Err(_) => {
                tracing::error!(timeout = ?self.drain_timeout, "drain deadline passed, forcing shutdown");
                ShutdownReason::Force
            }
        };
        self.close_pools();
        reason
    }

    /// Close all registered connection pools.
    pub fn close_pools(&self) {
        let pools = std::mem::take(&mut *self.pools.lock().unwrap_or_else(PoisonError::into_inner));
        for pool in pools {
            pool.shutdown_all();
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    signal(SignalKind::terminate())
        .wrap_err("Failed to register SIGTERM handler")?
        .recv()
        .await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PoolConfig;

    #[tokio::test]
    async fn shutdown_cancels_tokens_and_wakes_waiters() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let token = shutdown.cancellation_token();
        assert!(!shutdown.is_shutting_down());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait_for_shutdown_signal().await })
        };
        shutdown.shutdown();
        shutdown.shutdown();

        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke up")
            .unwrap();
        // A late waiter returns at once
        shutdown.wait_for_shutdown_signal().await;
    }

    #[tokio::test]
    async fn signal_handler_returns_after_shutdown() {
        let shutdown = GracefulShutdown::new();
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), shutdown.run_signal_handler())
            .await
            .expect("handler returned")
            .unwrap();
    }

    #[tokio::test]
    async fn drain_reports_how_it_ended_and_closes_pools() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_millis(50));
        let pool = Arc::new(ConnectionManager::new(PoolConfig::default()));
        shutdown.register_pool(pool.clone());

        assert_eq!(shutdown.drain(async {}).await, ShutdownReason::Graceful);
        assert!(pool.is_shut_down());

        let reason = shutdown.drain(std::future::pending::<()>()).await;
        assert_eq!(reason, ShutdownReason::Force);
    }
}
