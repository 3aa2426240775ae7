use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drive_core::{DriveClient, RemoteStore};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CloneConfig;
use crate::replicate::ids::extract_drive_id;
use crate::replicate::{
    CopyOutcome, EngineOptions, FolderSummary, LedgerError, ProgressLedger, ReplicateError,
    Replicator, SummaryAggregator, SummaryError, TaskProgress, TaskRecord,
};

const MIN_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not a drive id or share link: {0:?}")]
    InvalidId(String),
    #[error("no target given and no default target configured")]
    MissingTarget,
    #[error(transparent)]
    Replicate(#[from] ReplicateError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Entry point for front ends: copy, count and task bookkeeping.
pub struct CloneService<R = DriveClient> {
    replicator: Replicator<R>,
    aggregator: SummaryAggregator<R>,
    ledger: ProgressLedger,
    default_target: Option<String>,
}

impl CloneService<DriveClient> {
    /// Builds the drive client, opens the ledger and fails over tasks whose
    /// process died mid-run.
    pub async fn bootstrap(config: &CloneConfig) -> anyhow::Result<Self> {
        let auth = config.require_auth()?;
        let client = match config.api_base.as_deref() {
            Some(base) => DriveClient::with_base_url(base, auth),
            None => DriveClient::new(auth),
        }
        .context("failed to build drive client")?;

        let ledger = ProgressLedger::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open ledger at {}", config.db_path.display()))?;
        let stale_after = (config.progress_interval * 4).max(MIN_STALE_AFTER);
        let recovered = ledger
            .recover_interrupted(stale_after)
            .await
            .context("failed to recover interrupted tasks")?;
        if recovered > 0 {
            warn!(recovered, "marked interrupted tasks as failed, copy again to resume them");
        }

        info!(db = %config.db_path.display(), "ledger ready");
        Ok(Self::with_parts(
            Arc::new(client),
            ledger,
            config.engine_options(),
            config.default_target.clone(),
        ))
    }
}

impl<R: RemoteStore + 'static> CloneService<R> {
    pub fn with_parts(
        remote: Arc<R>,
        ledger: ProgressLedger,
        options: EngineOptions,
        default_target: Option<String>,
    ) -> Self {
        Self {
            replicator: Replicator::new(Arc::clone(&remote), ledger.clone(), options),
            aggregator: SummaryAggregator::new(remote, ledger.clone(), options),
            ledger,
            default_target,
        }
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    /// Admits a copy and returns without waiting for it.
    pub async fn start_copy(
        &self,
        source: &str,
        target: Option<&str>,
        force_refresh: bool,
    ) -> Result<CopyOutcome, ServiceError> {
        let (source, target) = self.resolve_pair(source, target)?;
        Ok(self.replicator.start(&source, &target, force_refresh).await?)
    }

    /// Copies in the foreground and returns once the task has ended.
    pub async fn copy(
        &self,
        source: &str,
        target: Option<&str>,
        force_refresh: bool,
    ) -> Result<CopyOutcome, ServiceError> {
        let (source, target) = self.resolve_pair(source, target)?;
        Ok(self.replicator.copy(&source, &target, force_refresh).await?)
    }

    pub async fn summary(&self, root: &str, force_refresh: bool) -> Result<FolderSummary, ServiceError> {
        let root = parse_id(root)?;
        Ok(self.aggregator.summarize(&root, force_refresh).await?)
    }

    pub async fn task_progress(&self, task_id: i64) -> Result<TaskProgress, ServiceError> {
        Ok(self.ledger.task_progress(task_id).await?)
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, ServiceError> {
        Ok(self.ledger.list_tasks().await?)
    }

    pub async fn active_tasks(&self) -> Result<Vec<TaskRecord>, ServiceError> {
        Ok(self.ledger.active_tasks().await?)
    }

    pub async fn remove_task(&self, task_id: i64) -> Result<(), ServiceError> {
        self.ledger.remove_task(task_id).await?;
        info!(task_id, "task removed");
        Ok(())
    }

    pub async fn clear_finished_tasks(&self) -> Result<u64, ServiceError> {
        let removed = self.ledger.clear_finished_tasks().await?;
        info!(removed, "finished tasks cleared");
        Ok(removed)
    }

    fn resolve_pair(&self, source: &str, target: Option<&str>) -> Result<(String, String), ServiceError> {
        let source = parse_id(source)?;
        let target = match target.map(str::trim).filter(|t| !t.is_empty()) {
            Some(target) => parse_id(target)?,
            None => self.default_target.clone().ok_or(ServiceError::MissingTarget)?,
        };
        Ok((source, target))
    }
}

fn parse_id(text: &str) -> Result<String, ServiceError> {
    extract_drive_id(text).ok_or_else(|| ServiceError::InvalidId(text.trim().to_string()))
}
