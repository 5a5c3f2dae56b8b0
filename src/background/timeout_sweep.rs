//! Timeout sweeper: periodic stage-timeout enforcement and archive pruning
//!
//! Bus delivery alone cannot notice a worker that never answers, so every
//! `sweep_interval` the sweeper asks the coordinator to fail silent stages.
//! Once an hour it also drops archived submissions past their retention.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::ARCHIVE_PRUNE_INTERVAL_SECS;
use crate::config::PipelineConfig;
use crate::pipeline::PipelineCoordinator;

pub struct TimeoutSweeper {
    coordinator: Arc<PipelineCoordinator>,
    sweep_interval: Duration,
    prune_interval: Duration,
    retention: chrono::Duration,
}

impl TimeoutSweeper {
    pub fn new(coordinator: Arc<PipelineCoordinator>, config: &PipelineConfig) -> Self {
        Self {
            coordinator,
            sweep_interval: config.timeouts.sweep_interval(),
            prune_interval: Duration::from_secs(ARCHIVE_PRUNE_INTERVAL_SECS),
            retention: chrono::Duration::days(i64::from(config.storage.archive_retention_days)),
        }
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            retention_days = self.retention.num_days(),
            "Timeout sweeper started"
        );

        let mut sweep_tick = tokio::time::interval(self.sweep_interval);
        let mut prune_tick = tokio::time::interval(self.prune_interval);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweeps = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(sweeps, "Timeout sweeper stopping");
                    return;
                }
                _ = sweep_tick.tick() => {
                    sweeps += 1;
                    if let Err(e) = self.coordinator.sweep(Utc::now()).await {
                        warn!(error = %e, "Timeout sweep failed");
                    }
                }
                _ = prune_tick.tick() => self.prune(),
            }
        }
    }

    fn prune(&self) {
        let cutoff = Utc::now() - self.retention;
        match self.coordinator.tracker().prune_archive(cutoff) {
            Ok(0) => debug!("No archived submissions past retention"),
            Ok(deleted) => info!(deleted, "Pruned archived submissions"),
            Err(e) => warn!(error = %e, "Archive pruning failed"),
        }
    }
}
