pub mod ids;
pub mod ledger;
pub mod replicator;
pub mod retry;
pub mod scheduler;
pub mod summary;
pub mod walker;

#[cfg(test)]
mod fake_remote;

use std::time::Duration;

pub use ledger::{
    BeginRun, FolderSummary, LedgerError, ProgressLedger, TaskProgress, TaskRecord, TaskStatus,
};
pub use replicator::{CopyOutcome, ReplicateError, Replicator, RunReport};
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use scheduler::{Budget, Scheduler, SchedulerError};
pub use summary::{SummaryAggregator, SummaryError};
pub use walker::{FolderWalker, NotFoundPolicy, WalkEntry, WalkError};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(5_000);

/// Knobs shared by the replicator and the summary aggregator.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub parallel_limit: usize,
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub not_found: NotFoundPolicy,
    pub progress_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallel_limit: scheduler::DEFAULT_PARALLEL_LIMIT,
            page_size: walker::DEFAULT_PAGE_SIZE,
            retry: RetryPolicy::default(),
            not_found: NotFoundPolicy::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

#[cfg(test)]
pub(crate) async fn test_ledger() -> ProgressLedger {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let ledger = ProgressLedger::from_pool(pool);
    ledger.init().await.unwrap();
    ledger
}

#[cfg(test)]
pub(crate) fn test_options() -> EngineOptions {
    EngineOptions {
        parallel_limit: 4,
        page_size: 3,
        retry: RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(5), 3)
            .with_pause(Backoff::none()),
        not_found: NotFoundPolicy::Abort,
        progress_interval: Duration::from_secs(60),
    }
}
