//! Background envelope polling and lifecycle sweep

use crate::config::SchedulerConfig;
use chrono::Utc;
use covenant_core::{ContractEngine, ContractError, PollSummary, SweepSummary};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Drives the poll half of reconciliation and the renewal/expiry sweep.
///
/// Webhooks may be lost or arrive out of order; the poll converges every open
/// envelope regardless.
pub struct Scheduler {
    config: SchedulerConfig,
    engine: Arc<ContractEngine>,
    running: Arc<RwLock<bool>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, engine: Arc<ContractEngine>) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine,
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            sweep_interval_secs = self.config.sweep_interval_secs,
            "scheduler started"
        );

        let mut poll = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        let mut sweep = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "envelope poll failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "lifecycle sweep failed");
                    }
                }
            }

            if !*self.running.read().await {
                break;
            }
        }

        tracing::info!("scheduler stopped");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    pub async fn poll_once(&self) -> Result<PollSummary, ContractError> {
        self.engine.poll_open_envelopes().await
    }

    pub async fn sweep_once(&self) -> Result<SweepSummary, ContractError> {
        let summary = self.engine.sweep_lifecycle(Utc::now().date_naive()).await?;
        if !summary.renewal_due.is_empty() || !summary.expired.is_empty() || !summary.failed.is_empty() {
            tracing::info!(
                renewal_due = summary.renewal_due.len(),
                expired = summary.expired.len(),
                failed = summary.failed.len(),
                "lifecycle sweep finished"
            );
        }
        Ok(summary)
    }
}
