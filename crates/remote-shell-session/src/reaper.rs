//! Periodic cleanup of idle sessions and old records.

use std::{sync::Arc, time::Duration};

use remote_shell_core::{ReaperConfig, RegistryError, RemotePlatform, SessionRegistry};
use tokio::{sync::oneshot, task::JoinHandle};

/// Totals from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle active sessions that were closed.
    pub closed_stale: usize,
    /// Terminal records deleted past retention.
    pub deleted: u64,
}

/// Closes idle sessions and prunes old terminal records.
#[derive(Clone)]
pub struct StaleSessionReaper {
    platform: Arc<dyn RemotePlatform>,
    registry: Arc<dyn SessionRegistry>,
}

impl StaleSessionReaper {
    #[must_use]
    pub fn new(platform: Arc<dyn RemotePlatform>, registry: Arc<dyn SessionRegistry>) -> Self {
        Self { platform, registry }
    }

    /// Close active sessions idle longer than `max_idle`, then delete
    /// closed and errored records older than `retention`.
    ///
    /// Active records are never deleted directly; they are closed first and
    /// only removed by a later sweep once past retention.
    ///
    /// # Errors
    /// Returns error if the registry fails.
    pub async fn sweep(
        &self,
        max_idle: Duration,
        retention: Duration,
    ) -> Result<SweepReport, RegistryError> {
        let stale = self.registry.find_stale(max_idle).await?;
        for record in &stale {
            if let Err(e) = self
                .platform
                .kill_session(&record.remote_host, &record.remote_session_id)
                .await
            {
                tracing::warn!(
                    session_id = %record.remote_session_id,
                    host = %record.remote_host,
                    error = %e,
                    "Failed to kill stale session"
                );
            }
            self.registry.close(record.id).await?;
            tracing::debug!(record_id = %record.id, "Closed stale session");
        }

        let deleted = self.registry.delete_old(retention).await?;
        let report = SweepReport {
            closed_stale: stale.len(),
            deleted,
        };
        if report != SweepReport::default() {
            tracing::info!(
                closed_stale = report.closed_stale,
                deleted = report.deleted,
                "Swept sessions"
            );
        }
        Ok(report)
    }

    /// Sweep every `config.interval` until the handle is shut down.
    #[must_use]
    pub fn spawn(self, config: ReaperConfig) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep(config.max_idle, config.retention).await {
                            tracing::warn!(error = %e, "Sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("Reaper stopped");
        });
        ReaperHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running reaper task.
pub struct ReaperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for the current sweep to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "Reaper task failed");
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            self.task.abort();
        }
    }
}
