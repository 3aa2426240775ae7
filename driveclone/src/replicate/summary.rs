use std::collections::HashSet;
use std::sync::Arc;

use drive_core::RemoteStore;
use thiserror::Error;
use tracing::{debug, info};

use super::EngineOptions;
use super::ledger::{FolderSummary, LedgerError, ProgressLedger};
use super::scheduler::Budget;
use super::walker::{FolderWalker, WalkEntry, WalkError, follow_shortcut};

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("cannot resolve {id}: {source}")]
    Root {
        id: String,
        #[source]
        source: WalkError,
    },
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Counts files, folders and bytes below a folder, caching the result.
pub struct SummaryAggregator<R> {
    remote: Arc<R>,
    ledger: ProgressLedger,
    options: EngineOptions,
}

impl<R: RemoteStore + 'static> SummaryAggregator<R> {
    pub fn new(remote: Arc<R>, ledger: ProgressLedger, options: EngineOptions) -> Self {
        Self {
            remote,
            ledger,
            options,
        }
    }

    pub async fn summarize(&self, root: &str, force_refresh: bool) -> Result<FolderSummary, SummaryError> {
        if !force_refresh {
            if let Some(cached) = self.ledger.get_summary(root).await? {
                if !cached.stale {
                    debug!(root, "summary served from cache");
                    return Ok(cached.summary);
                }
            }
        }

        let budget = Budget::new(self.options.parallel_limit);
        let resolved = follow_shortcut(self.remote.as_ref(), &budget, &self.options.retry, root)
            .await
            .map_err(|source| SummaryError::Root {
                id: root.to_string(),
                source,
            })?;
        if !resolved.is_folder() {
            return Ok(FolderSummary {
                file_count: 1,
                folder_count: 0,
                total_size: resolved.size.unwrap_or(0),
            });
        }

        let walker = FolderWalker::new(Arc::clone(&self.remote), budget, self.options.retry)
            .page_size(self.options.page_size)
            .not_found(self.options.not_found)
            .listing_cache(self.ledger.clone(), force_refresh);
        let mut walk = walker.walk(&resolved.id);
        let mut summary = FolderSummary::default();
        let mut seen_files = HashSet::new();

        while let Some(found) = walk.next().await? {
            match found {
                WalkEntry::Folder { entry, .. } => {
                    summary.folder_count += 1;
                    walk.descend(&entry.id);
                }
                WalkEntry::File { entry, .. } => {
                    if seen_files.insert(entry.id) {
                        summary.file_count += 1;
                        summary.total_size += entry.size.unwrap_or(0);
                    }
                }
            }
        }

        if walk.skipped() == 0 {
            self.ledger.put_summary(root, &summary).await?;
            if resolved.id != root {
                self.ledger.put_summary(&resolved.id, &summary).await?;
            }
        }
        info!(
            root,
            files = summary.file_count,
            folders = summary.folder_count,
            bytes = summary.total_size,
            skipped = walk.skipped(),
            "tree counted"
        );
        Ok(summary)
    }
}
