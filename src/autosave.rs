//! Periodic auto-save of dirty vaults

use crate::storage::{Persister, SaveReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Background task that flushes dirty records on a fixed interval
pub struct AutoSaver {
    persister: Arc<Persister>,
    timeout: Duration,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl AutoSaver {
    /// Start the auto-save loop on the current runtime
    ///
    /// The first run happens one `interval` after start. Runs never overlap;
    /// ticks missed while a run is in progress are skipped.
    pub fn spawn(persister: Arc<Persister>, interval: Duration, timeout: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let task_persister = Arc::clone(&persister);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_pass(&task_persister, timeout).await;
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("Auto-save loop stopped");
        });

        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = timeout.as_secs(),
            "Auto-save started"
        );

        Self {
            persister,
            timeout,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Run one pass now, outside the schedule
    pub async fn run_once(&self) -> SaveReport {
        run_pass(&self.persister, self.timeout).await
    }

    /// Stop the loop and wait for an in-progress pass to finish
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Auto-save task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for AutoSaver {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Save everything dirty at this instant
async fn run_pass(persister: &Arc<Persister>, timeout: Duration) -> SaveReport {
    let dirty = persister.cache().dirty_users();
    if dirty.is_empty() {
        debug!("Auto-save: nothing dirty");
        return SaveReport::default();
    }

    let report = persister.save_all(dirty, timeout).await;
    persister.metrics().record("autosave", report.elapsed);
    info!(
        saved = report.succeeded,
        failed = report.failed,
        abandoned = report.abandoned,
        "Auto-save pass complete"
    );
    report
}
