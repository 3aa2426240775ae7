use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use drive_core::{DriveFile, RemoteStore};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::EngineOptions;
use super::ledger::{BeginRun, FolderSummary, LedgerError, ProgressLedger, TaskStatus};
use super::retry::RetryError;
use super::scheduler::{Budget, Scheduler, SchedulerError};
use super::walker::{Entry, FolderWalker, NotFoundPolicy, Walk, WalkEntry, WalkError, follow_shortcut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The source was a plain file; it was copied without creating a task.
    SingleFile { file_id: String },
    /// The run was admitted and continues in the background.
    Started { task_id: i64 },
    AlreadyRunning { task_id: i64 },
    Finished { task_id: i64, report: RunReport },
}

impl CopyOutcome {
    pub fn task_id(&self) -> Option<i64> {
        match self {
            CopyOutcome::SingleFile { .. } => None,
            CopyOutcome::Started { task_id }
            | CopyOutcome::AlreadyRunning { task_id }
            | CopyOutcome::Finished { task_id, .. } => Some(*task_id),
        }
    }
}

/// What one run did. `folders_created` excludes the destination root, like
/// `summary.folder_count` excludes the source root. `summary` covers the
/// whole source tree, including the parts copied by earlier runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub folders_created: u64,
    pub files_copied: u64,
    pub files_already_copied: u64,
    pub skipped: u64,
    pub summary: FolderSummary,
}

#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("cannot resolve source {id}: {source}")]
    Source {
        id: String,
        #[source]
        source: WalkError,
    },
    #[error("copying file {file_id} failed: {source}")]
    SingleFile {
        file_id: String,
        #[source]
        source: RetryError,
    },
    #[error("creating folder {name:?} for {folder_id} failed: {source}")]
    CreateFolder {
        folder_id: String,
        name: String,
        #[source]
        source: RetryError,
    },
    #[error("copying file {file_id} failed: {source}")]
    CopyFile {
        file_id: String,
        #[source]
        source: RetryError,
    },
    #[error("folder {0} has no mapped parent")]
    UnmappedParent(String),
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: i64, message: String },
}

enum Admission {
    SingleFile(String),
    AlreadyRunning(i64),
    Run(RunPlan),
}

struct RunPlan {
    task_id: i64,
    source: DriveFile,
    target: String,
    budget: Budget,
}

enum JobDone {
    Folder {
        folder_id: String,
        name: String,
        result: Result<DriveFile, RetryError>,
    },
    File {
        file_id: String,
        result: Result<DriveFile, RetryError>,
    },
}

/// Copies folder trees server-side, resumably, through the progress ledger.
pub struct Replicator<R> {
    remote: Arc<R>,
    ledger: ProgressLedger,
    options: EngineOptions,
}

impl<R> Clone for Replicator<R> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            ledger: self.ledger.clone(),
            options: self.options,
        }
    }
}

impl<R: RemoteStore + 'static> Replicator<R> {
    pub fn new(remote: Arc<R>, ledger: ProgressLedger, options: EngineOptions) -> Self {
        Self {
            remote,
            ledger,
            options,
        }
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    /// Copies `source` into `target` and waits for the run to end.
    pub async fn copy(
        &self,
        source: &str,
        target: &str,
        force_refresh: bool,
    ) -> Result<CopyOutcome, ReplicateError> {
        match self.admit(source, target).await? {
            Admission::SingleFile(file_id) => Ok(CopyOutcome::SingleFile { file_id }),
            Admission::AlreadyRunning(task_id) => Ok(CopyOutcome::AlreadyRunning { task_id }),
            Admission::Run(plan) => {
                let task_id = plan.task_id;
                let report = self.run_task(plan, force_refresh).await?;
                Ok(CopyOutcome::Finished { task_id, report })
            }
        }
    }

    /// Admits the run like [`Replicator::copy`] but returns as soon as the
    /// task exists; the run itself goes on in a spawned task.
    pub async fn start(
        &self,
        source: &str,
        target: &str,
        force_refresh: bool,
    ) -> Result<CopyOutcome, ReplicateError> {
        match self.admit(source, target).await? {
            Admission::SingleFile(file_id) => Ok(CopyOutcome::SingleFile { file_id }),
            Admission::AlreadyRunning(task_id) => Ok(CopyOutcome::AlreadyRunning { task_id }),
            Admission::Run(plan) => {
                let task_id = plan.task_id;
                let replicator = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = replicator.run_task(plan, force_refresh).await {
                        error!(task_id, error = %err, "copy task failed");
                    }
                });
                Ok(CopyOutcome::Started { task_id })
            }
        }
    }

    async fn admit(&self, source: &str, target: &str) -> Result<Admission, ReplicateError> {
        let budget = Budget::new(self.options.parallel_limit);
        let resolved = follow_shortcut(self.remote.as_ref(), &budget, &self.options.retry, source)
            .await
            .map_err(|source_err| ReplicateError::Source {
                id: source.to_string(),
                source: source_err,
            })?;

        if !resolved.is_folder() {
            let remote: &R = &self.remote;
            let file_id: &str = &resolved.id;
            let copy = budget
                .run(
                    self.options
                        .retry
                        .run("copy_file", move || remote.copy_file(file_id, target)),
                )
                .await?
                .map_err(|source| ReplicateError::SingleFile {
                    file_id: resolved.id.clone(),
                    source,
                })?;
            info!(source = %resolved.id, target, copy = %copy.id, "copied single file");
            return Ok(Admission::SingleFile(copy.id));
        }

        match self.ledger.begin_run(&resolved.id, target).await? {
            BeginRun::AlreadyRunning(task_id) => {
                info!(task_id, source = %resolved.id, target, "task already running");
                Ok(Admission::AlreadyRunning(task_id))
            }
            BeginRun::Started(task_id) => {
                info!(task_id, source = %resolved.id, target, "task queued");
                Ok(Admission::Run(RunPlan {
                    task_id,
                    source: resolved,
                    target: target.to_string(),
                    budget,
                }))
            }
        }
    }

    async fn run_task(&self, plan: RunPlan, force_refresh: bool) -> Result<RunReport, ReplicateError> {
        let task_id = plan.task_id;
        match self.drive_run(&plan, force_refresh).await {
            Ok(report) => {
                self.ledger.finish_task(task_id).await?;
                if report.skipped == 0 {
                    self.ledger.put_summary(&plan.source.id, &report.summary).await?;
                }
                self.ledger.invalidate_folder(&plan.target).await?;
                info!(
                    task_id,
                    folders_created = report.folders_created,
                    files_copied = report.files_copied,
                    files_already_copied = report.files_already_copied,
                    skipped = report.skipped,
                    "task finished"
                );
                Ok(report)
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(ledger_err) = self.ledger.fail_task(task_id, &message).await {
                    warn!(task_id, error = %ledger_err, "could not record task failure");
                }
                error!(task_id, error = %message, "task stopped");
                Err(ReplicateError::TaskFailed { task_id, message })
            }
        }
    }

    async fn drive_run(&self, plan: &RunPlan, force_refresh: bool) -> Result<RunReport, ReplicateError> {
        let task_id = plan.task_id;
        let options = &self.options;
        self.ledger.set_status(task_id, TaskStatus::Copying).await?;

        let mut run = RunState {
            task_id,
            not_found: options.not_found,
            mapping: self
                .ledger
                .mapping(task_id)
                .await?
                .into_iter()
                .map(|row| (row.source_id, row.target_id))
                .collect(),
            copied: self.ledger.copied_file_ids(task_id).await?,
            seen_files: HashSet::new(),
            targets: HashSet::new(),
            report: RunReport::default(),
        };
        run.targets.extend(run.mapping.values().cloned());
        if !run.copied.is_empty() || run.mapping.len() > 1 {
            info!(
                task_id,
                folders = run.mapping.len().saturating_sub(1),
                files = run.copied.len(),
                "resuming from recorded progress"
            );
        }

        if !run.mapping.contains_key(&plan.source.id) {
            let remote: &R = &self.remote;
            let parent: &str = &plan.target;
            let name: &str = &plan.source.name;
            let root = plan
                .budget
                .run(
                    options
                        .retry
                        .run("create_folder", move || remote.create_folder(parent, name)),
                )
                .await?
                .map_err(|source| ReplicateError::CreateFolder {
                    folder_id: plan.source.id.clone(),
                    name: plan.source.name.clone(),
                    source,
                })?;
            self.ledger
                .append_mapping(task_id, &plan.source.id, &root.id)
                .await?;
            run.targets.insert(root.id.clone());
            run.mapping.insert(plan.source.id.clone(), root.id);
        }

        let walker = FolderWalker::new(Arc::clone(&self.remote), plan.budget.clone(), options.retry)
            .page_size(options.page_size)
            .not_found(options.not_found)
            .listing_cache(self.ledger.clone(), force_refresh);
        let mut walk = walker.walk(&plan.source.id);
        let mut jobs: Scheduler<JobDone> = Scheduler::new(plan.budget.clone());
        let mut failure: Option<ReplicateError> = None;
        let mut cancelled = 0_u64;

        let mut ticker = tokio::time::interval(options.progress_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if jobs.is_empty() && (failure.is_some() || walk.is_idle()) {
                break;
            }
            tokio::select! {
                next = walk.next(), if failure.is_none() && !walk.is_idle() => {
                    let dispatched = match next {
                        Ok(Some(found)) => self.dispatch(&mut run, &mut walk, &mut jobs, found),
                        Ok(None) => Ok(()),
                        Err(err) => Err(err.into()),
                    };
                    if let Err(err) = dispatched {
                        stop_run(&mut failure, &plan.budget, err);
                    }
                }
                Some(done) = jobs.next_completed(), if !jobs.is_empty() => {
                    let handled = match done {
                        Ok(job) => self.complete(&mut run, &mut walk, job, failure.is_none()).await,
                        // Never started: the budget was closed by an earlier failure.
                        Err(SchedulerError::Closed) if failure.is_some() => {
                            cancelled += 1;
                            Ok(())
                        }
                        Err(err) => Err(err.into()),
                    };
                    if let Err(err) = handled {
                        stop_run(&mut failure, &plan.budget, err);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.ledger.touch_task(task_id).await {
                        warn!(task_id, error = %err, "could not refresh task heartbeat");
                    }
                    info!(
                        task_id,
                        folders = run.mapping.len().saturating_sub(1),
                        files = run.copied.len(),
                        queued = jobs.len(),
                        in_flight = plan.budget.in_flight(),
                        "copy in progress"
                    );
                }
            }
        }

        if let Some(err) = failure {
            if cancelled > 0 {
                info!(task_id, cancelled, "queued work dropped after failure");
            }
            return Err(err);
        }
        run.report.skipped += walk.skipped() as u64;
        Ok(run.report)
    }

    fn dispatch(
        &self,
        run: &mut RunState,
        walk: &mut Walk<R>,
        jobs: &mut Scheduler<JobDone>,
        found: WalkEntry,
    ) -> Result<(), ReplicateError> {
        match found {
            WalkEntry::Folder { parent, entry } => {
                if run.targets.contains(&entry.id) {
                    debug!(task_id = run.task_id, folder = %entry.id, "not walking into a folder this task created");
                    return Ok(());
                }
                run.report.summary.folder_count += 1;
                if run.mapping.contains_key(&entry.id) {
                    walk.descend(&entry.id);
                    return Ok(());
                }
                let parent_target = run.parent_target(&parent)?;
                let remote = Arc::clone(&self.remote);
                let retry = self.options.retry;
                jobs.submit(async move {
                    let store: &R = &remote;
                    let parent: &str = &parent_target;
                    let name: &str = &entry.name;
                    let result = retry
                        .run("create_folder", move || store.create_folder(parent, name))
                        .await;
                    JobDone::Folder {
                        folder_id: entry.id,
                        name: entry.name,
                        result,
                    }
                });
            }
            WalkEntry::File { parent, entry } => {
                if !run.count_file(&entry) {
                    return Ok(());
                }
                if run.copied.contains(&entry.id) {
                    run.report.files_already_copied += 1;
                    return Ok(());
                }
                let parent_target = run.parent_target(&parent)?;
                let remote = Arc::clone(&self.remote);
                let retry = self.options.retry;
                jobs.submit(async move {
                    let store: &R = &remote;
                    let parent: &str = &parent_target;
                    let file_id: &str = &entry.id;
                    let result = retry
                        .run("copy_file", move || store.copy_file(file_id, parent))
                        .await;
                    JobDone::File {
                        file_id: entry.id,
                        result,
                    }
                });
            }
        }
        Ok(())
    }

    async fn complete(
        &self,
        run: &mut RunState,
        walk: &mut Walk<R>,
        job: JobDone,
        descend: bool,
    ) -> Result<(), ReplicateError> {
        match job {
            JobDone::Folder {
                folder_id,
                name,
                result,
            } => {
                let created = result.map_err(|source| ReplicateError::CreateFolder {
                    folder_id: folder_id.clone(),
                    name,
                    source,
                })?;
                self.ledger
                    .append_mapping(run.task_id, &folder_id, &created.id)
                    .await?;
                run.targets.insert(created.id.clone());
                run.mapping.insert(folder_id.clone(), created.id);
                run.report.folders_created += 1;
                if descend {
                    walk.descend(&folder_id);
                }
            }
            JobDone::File { file_id, result } => {
                match result {
                    Ok(_) => {
                        self.ledger.record_copied(run.task_id, &file_id).await?;
                        run.copied.insert(file_id);
                        run.report.files_copied += 1;
                    }
                    Err(err) if err.is_not_found() && run.not_found == NotFoundPolicy::Skip => {
                        warn!(task_id = run.task_id, file = %file_id, "skipping missing file");
                        run.report.skipped += 1;
                    }
                    Err(source) => return Err(ReplicateError::CopyFile { file_id, source }),
                }
            }
        }
        Ok(())
    }
}

/// Records the first failure and closes the run's budget so queued units
/// never start. Units already holding a permit finish and are recorded.
fn stop_run(failure: &mut Option<ReplicateError>, budget: &Budget, err: ReplicateError) {
    if failure.is_none() {
        budget.close();
        *failure = Some(err);
    }
}

struct RunState {
    task_id: i64,
    not_found: NotFoundPolicy,
    mapping: HashMap<String, String>,
    copied: HashSet<String>,
    seen_files: HashSet<String>,
    /// Folders created by this task; skipped if the target lies inside the source.
    targets: HashSet<String>,
    report: RunReport,
}

impl RunState {
    fn parent_target(&self, parent: &str) -> Result<String, ReplicateError> {
        self.mapping
            .get(parent)
            .cloned()
            .ok_or_else(|| ReplicateError::UnmappedParent(parent.to_string()))
    }

    /// Counts a file towards the summary. A file listed under several
    /// parents is counted and copied once; returns false for repeats.
    fn count_file(&mut self, entry: &Entry) -> bool {
        if !self.seen_files.insert(entry.id.clone()) {
            return false;
        }
        self.report.summary.file_count += 1;
        self.report.summary.total_size += entry.size.unwrap_or(0);
        true
    }
}

#[cfg(test)]
#[path = "replicator_tests.rs"]
mod tests;
