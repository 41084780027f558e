//! Periodic compaction sweep.

use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::engine::{CompactionOutcome, SyncEngine};

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub compacted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub evicted: usize,
}

pub struct CompactionScheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    idle_eviction: Duration,
}

impl CompactionScheduler {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration, idle_eviction: Duration) -> Self {
        Self {
            engine,
            interval,
            idle_eviction,
        }
    }

    /// Compact every known document, then evict idle ones.
    ///
    /// A failure on one document is logged and counted; the sweep carries on.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let documents = match self.engine.known_documents().await {
            Ok(documents) => documents,
            Err(e) => {
                error!("Compaction sweep could not list documents: {}", e);
                return report;
            }
        };

        for document_id in &documents {
            match self.engine.compact(document_id).await {
                Ok(CompactionOutcome::Compacted { .. }) => report.compacted += 1,
                Ok(CompactionOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!("Compaction of {} failed: {}", document_id, e);
                    report.failed += 1;
                }
            }
        }

        report.evicted = self.engine.evict_idle(self.idle_eviction).await;
        debug!(
            "Sweep over {} documents: {} compacted, {} skipped, {} failed, {} evicted",
            documents.len(),
            report.compacted,
            report.skipped,
            report.failed,
            report.evicted
        );
        report
    }

    /// Run sweeps on a fixed interval until the handle is shut down.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Compaction scheduler running every {:?}", self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = &mut shutdown_rx => {
                        info!("Compaction scheduler stopped");
                        break;
                    }
                }
            }
        });
        SchedulerHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

pub struct SchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for an in-flight sweep to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}
