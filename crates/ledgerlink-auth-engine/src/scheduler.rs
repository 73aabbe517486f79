//! Background token refresh sweep.
//!
//! [`RefreshScheduler`] is an explicit service object: construct it once,
//! `start()` it, `stop()` it. Starting a scheduler that is already running
//! is rejected, so at most one sweep loop runs per instance. A stopped
//! scheduler can be started again.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AuthEngineError, Result};
use crate::providers::Provider;
use crate::refresh::TokenRefresher;

/// Outcome of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Credentials found inside the refresh threshold.
    pub checked: usize,
    pub refreshed: usize,
    pub failed: usize,
}

pub struct RefreshScheduler {
    refresher: Arc<TokenRefresher>,
    interval: std::time::Duration,
    running: AtomicBool,
    shutdown: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(refresher: Arc<TokenRefresher>, interval: std::time::Duration) -> Self {
        Self {
            refresher,
            interval,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AuthEngineError::SchedulerAlreadyRunning);
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(interval_secs = this.interval.as_secs(), "token refresh scheduler started");

            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match this.sweep_once().await {
                            Ok(report) if report.checked > 0 => info!(
                                checked = report.checked,
                                refreshed = report.refreshed,
                                failed = report.failed,
                                "refresh sweep finished"
                            ),
                            Ok(_) => debug!("refresh sweep found nothing due"),
                            Err(e) => error!(error = %e, "refresh sweep failed"),
                        }
                    }
                    _ = this.shutdown.notified() => break,
                }
            }

            info!("token refresh scheduler stopped");
        });

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop the loop and wait for an in-flight sweep to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("stop called but refresh scheduler is not running");
            return;
        }

        self.shutdown.notify_one();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "refresh scheduler task panicked during shutdown");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Refresh every active credential that expires within the threshold.
    ///
    /// A failure on one provider does not stop the others.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.refresher.clock().now();
        let due = self
            .refresher
            .credentials()
            .due_for_refresh(now, self.refresher.threshold())
            .await?;

        let mut report = SweepReport {
            checked: due.len(),
            ..SweepReport::default()
        };

        for candidate in due {
            let Some(provider) = Provider::parse(&candidate.provider) else {
                warn!(provider = %candidate.provider, "skipping credential for unknown provider");
                report.failed += 1;
                continue;
            };

            match self.refresher.refresh_if_due(provider).await {
                Ok(_) => report.refreshed += 1,
                Err(e) => {
                    error!(provider = %provider, error = %e, "scheduled refresh failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
