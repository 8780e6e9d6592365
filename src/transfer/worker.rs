//! Recovery Worker
//!
//! Scans for transfers stuck in non-terminal states and resumes them. The
//! startup sweep resumes every incomplete transfer; periodic scans only pick
//! up transfers that have not moved for `stale_threshold_ms`, so they do not
//! race a live worker.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::orchestrator::TransferOrchestrator;

/// Configuration for the recovery worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Spawn the periodic scan loop
    pub enabled: bool,
    /// How often to scan for stale transfers
    pub scan_interval_ms: u64,
    /// How long a transfer must be idle to be considered stale
    pub stale_threshold_ms: u64,
    /// Maximum transfers to resume per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: 30_000,
            stale_threshold_ms: 60_000,
            batch_size: 100,
        }
    }
}

impl WorkerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }
}

pub struct RecoveryWorker {
    orchestrator: Arc<TransferOrchestrator>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(orchestrator: Arc<TransferOrchestrator>, config: WorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn with_defaults(orchestrator: Arc<TransferOrchestrator>) -> Self {
        Self::new(orchestrator, WorkerConfig::default())
    }

    /// Run the recovery loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_ms = self.config.scan_interval_ms,
            stale_threshold_ms = self.config.stale_threshold_ms,
            "Starting recovery worker"
        );

        loop {
            tokio::time::sleep(self.config.scan_interval()).await;

            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }
        }
    }

    /// Startup sweep: resume every incomplete transfer regardless of age
    pub async fn recover_all(&self) -> Result<usize, TransferError> {
        self.recover_older_than(Duration::ZERO).await
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_and_recover(&self) -> Result<usize, TransferError> {
        self.recover_older_than(self.config.stale_threshold()).await
    }

    async fn recover_older_than(&self, idle: Duration) -> Result<usize, TransferError> {
        let idle = chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let stale: Vec<_> = self
            .orchestrator
            .store()
            .find_incomplete()
            .await?
            .into_iter()
            .filter(|t| now.signed_duration_since(t.updated_at) >= idle)
            .take(self.config.batch_size)
            .collect();

        self.report_reconciliation_backlog().await;

        if stale.is_empty() {
            debug!("No stale transfers found");
            return Ok(0);
        }

        info!(count = stale.len(), "Found stale transfers to recover");

        let results = join_all(stale.iter().map(|t| {
            debug!(
                transfer_ref = %t.transfer_ref,
                status = %t.status,
                version = t.version,
                "Recovering transfer"
            );
            self.orchestrator.resume(t.transfer_ref)
        }))
        .await;

        let mut recovered = 0;
        for (transfer, result) in stale.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    info!(
                        transfer_ref = %transfer.transfer_ref,
                        old_status = %transfer.status,
                        new_status = %outcome.status,
                        "Transfer recovered"
                    );
                    recovered += 1;
                }
                Err(e) => {
                    error!(
                        transfer_ref = %transfer.transfer_ref,
                        error = %e,
                        "Failed to recover transfer"
                    );
                }
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered transfers this scan");
        }
        Ok(recovered)
    }

    async fn report_reconciliation_backlog(&self) {
        match self.orchestrator.store().find_reconciliation_required().await {
            Ok(pending) if !pending.is_empty() => {
                warn!(
                    count = pending.len(),
                    "Transfers awaiting manual reconciliation"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Cannot read reconciliation backlog"),
        }
    }
}
