//! Retention sweep for completed and failed records

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::AppResult;
use crate::models::TerminalKind;
use crate::store::QueueStore;
use crate::utils::cron_helper;

/// Records removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub completed_removed: usize,
    pub failed_removed: usize,
}

/// Deletes terminal records older than `max_age`, judged by their own timestamp
///
/// Per-field expiry on the store normally removes records first; the sweep
/// covers stores that cannot expire hash fields.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn QueueStore>,
    queue_name: String,
    max_age: Duration,
    schedule: Schedule,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn QueueStore>,
        queue_name: impl Into<String>,
        max_age: Duration,
        sweep_schedule: &str,
    ) -> AppResult<Self> {
        Ok(Self {
            store,
            queue_name: queue_name.into(),
            max_age,
            schedule: cron_helper::parse_schedule(sweep_schedule)?,
        })
    }

    /// Remove every record finished before `now - max_age`
    pub async fn sweep(&self, now: DateTime<Utc>) -> AppResult<SweepReport> {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = SweepReport::default();
        for kind in [TerminalKind::Completed, TerminalKind::Failed] {
            let expired: Vec<String> = self
                .store
                .terminal_entries(&self.queue_name, kind)
                .await?
                .into_iter()
                .filter(|entry| entry.finished_at < cutoff)
                .map(|entry| entry.task_id)
                .collect();

            let removed = self
                .store
                .purge_terminal(&self.queue_name, kind, &expired)
                .await?;
            match kind {
                TerminalKind::Completed => report.completed_removed = removed,
                TerminalKind::Failed => report.failed_removed = removed,
            }
        }

        info!(
            "Retention sweep removed {} completed and {} failed records older than {}",
            report.completed_removed, report.failed_removed, cutoff
        );
        Ok(report)
    }

    /// Sweep on every tick of the configured schedule until cancelled
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting retention sweeper for queue '{}'", self.queue_name);

        loop {
            let Some(next) = cron_helper::next_after(&self.schedule, Utc::now()) else {
                info!("Retention schedule has no future runs, sweeper exiting");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!("Next retention sweep at {}", next);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!("Retention sweep failed: {}", e);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("Retention sweeper received cancellation signal");
                    break;
                }
            }
        }
    }
}
