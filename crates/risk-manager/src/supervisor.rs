//! Restart-on-failure supervision for long-running workers.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Respawns workers that fail, return early or panic.
pub struct Supervisor {
    restart_delay: Duration,
    grace: Duration,
    restarts: AtomicU64,
}

impl Supervisor {
    pub fn new(restart_delay: Duration, grace: Duration) -> Self {
        Self {
            restart_delay,
            grace,
            restarts: AtomicU64::new(0),
        }
    }

    /// Restarts across every worker this supervisor owns.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Run `factory`'s worker until shutdown, respawning it after
    /// `restart_delay` whenever it stops on its own. On shutdown the worker
    /// gets `grace` to finish before it is aborted.
    pub async fn supervise<F, Fut>(
        &self,
        name: &str,
        mut factory: F,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: FnMut(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut handle = tokio::spawn(factory(shutdown.clone()));
            info!(worker = name, "Worker started");

            let joined = tokio::select! {
                joined = &mut handle => Some(joined),
                _ = shutdown.changed() => None,
            };

            match joined {
                None => {
                    match tokio::time::timeout(self.grace, &mut handle).await {
                        Ok(_) => info!(worker = name, "Worker stopped"),
                        Err(_) => {
                            warn!(worker = name, grace_ms = self.grace.as_millis() as u64, "Worker missed shutdown grace, aborting");
                            handle.abort();
                        }
                    }
                    return;
                }
                Some(Ok(Ok(()))) => {
                    if *shutdown.borrow() {
                        return;
                    }
                    warn!(worker = name, "Worker exited unexpectedly");
                }
                Some(Ok(Err(e))) => {
                    error!(worker = name, error = %e, "Worker failed");
                }
                Some(Err(join_error)) if join_error.is_panic() => {
                    error!(worker = name, "Worker panicked");
                }
                Some(Err(join_error)) => {
                    warn!(worker = name, error = %join_error, "Worker cancelled");
                }
            }

            let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                worker = name,
                restarts,
                delay_ms = self.restart_delay.as_millis() as u64,
                "Restarting worker"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.restart_delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}
