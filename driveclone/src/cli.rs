use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::replicate::{CopyOutcome, FolderSummary, TaskProgress, TaskRecord};

#[derive(Debug, Parser)]
#[command(name = "driveclone")]
#[command(about = "Server-side copies of shared drive folders", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Count files, folders and bytes under a folder or share link
    Count {
        source: String,
        /// Ignore cached listings and summaries
        #[arg(short = 'u', long = "update")]
        update: bool,
    },
    /// Copy a folder tree (or a single file) into a target folder.
    ///
    /// A copy whose process died stays "copying" for about a minute before
    /// it can be resumed; until then this reports the task as already running.
    Copy {
        source: String,
        /// Defaults to DRIVECLONE_DEFAULT_TARGET
        target: Option<String>,
        /// Re-list folders instead of trusting cached listings
        #[arg(short = 'u', long = "update")]
        update: bool,
    },
    /// Inspect copy tasks; without an action, lists the active ones
    Task {
        #[command(subcommand)]
        action: Option<TaskAction>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TaskAction {
    /// Show progress of one task
    Show { id: i64 },
    /// List every task
    All,
    /// Remove finished tasks
    Clear,
    /// Remove a task together with its progress
    Rm { id: i64 },
}

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

pub fn format_time(unix: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| unix.to_string())
}

pub fn render_summary(root: &str, summary: &FolderSummary) -> String {
    format!(
        "{root}: {} files, {} folders, {}",
        summary.file_count,
        summary.folder_count,
        format_size(summary.total_size)
    )
}

pub fn render_outcome(outcome: &CopyOutcome) -> String {
    match outcome {
        CopyOutcome::SingleFile { file_id } => format!("copied file {file_id}"),
        CopyOutcome::Started { task_id } => format!("task {task_id} started"),
        CopyOutcome::AlreadyRunning { task_id } => {
            format!(
                "task {task_id} is already running for this source and target \
                 (if its process died, retry in a minute to resume it)"
            )
        }
        CopyOutcome::Finished { task_id, report } => format!(
            "task {task_id} finished: {} folders created, {} files copied, {} already present, {} skipped ({} files, {})",
            report.folders_created,
            report.files_copied,
            report.files_already_copied,
            report.skipped,
            report.summary.file_count,
            format_size(report.summary.total_size)
        ),
    }
}

pub fn render_task_line(task: &TaskRecord) -> String {
    format!(
        "#{} {} {} -> {} (created {})",
        task.id,
        task.status.as_str(),
        task.source,
        task.target,
        format_time(task.created_at)
    )
}

pub fn render_progress(progress: &TaskProgress) -> String {
    let task = &progress.task;
    let mut lines = vec![render_task_line(task)];
    if let Some(root) = &progress.root_target {
        lines.push(format!("new folder: {root}"));
    }
    lines.push(format!(
        "folders: {}/{}  files: {}/{}",
        progress.folders_done,
        total_or_unknown(progress.folders_total),
        progress.files_done,
        total_or_unknown(progress.files_total)
    ));
    if let Some(size) = progress.total_size {
        lines.push(format!("size: {}", format_size(size)));
    }
    if let Some(percent) = progress.percent {
        lines.push(format!("progress: {percent}%"));
    }
    if let Some(finished) = task.finished_at {
        lines.push(format!("ended: {}", format_time(finished)));
    }
    if let Some(error) = &task.error {
        lines.push(format!("error: {error}"));
    }
    lines.join("\n")
}

fn total_or_unknown(total: Option<u64>) -> String {
    total.map_or_else(|| "?".to_string(), |t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicate::{RunReport, TaskStatus};

    fn task(status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id: 7,
            source: "src".into(),
            target: "dst".into(),
            status,
            created_at: 0,
            finished_at: None,
            error: None,
        }
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.00 GB");
        assert_eq!(format_size(u64::MAX), "16777216.00 TB");
    }

    #[test]
    fn times_render_as_rfc3339() {
        assert_eq!(format_time(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_time(i64::MAX), i64::MAX.to_string());
    }

    #[test]
    fn parses_copy_with_optional_target() {
        let cli = Cli::try_parse_from(["driveclone", "copy", "src", "-u"]).unwrap();
        match cli.command {
            Commands::Copy { source, target, update } => {
                assert_eq!(source, "src");
                assert!(target.is_none());
                assert!(update);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_task_actions() {
        let cli = Cli::try_parse_from(["driveclone", "task", "rm", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Task { action: Some(TaskAction::Rm { id: 3 }) }
        ));
        let cli = Cli::try_parse_from(["driveclone", "task"]).unwrap();
        assert!(matches!(cli.command, Commands::Task { action: None }));
        assert!(Cli::try_parse_from(["driveclone", "task", "show", "x"]).is_err());
    }

    #[test]
    fn progress_shows_totals_and_error() {
        let mut failed = task(TaskStatus::Error);
        failed.error = Some("quota".into());
        failed.finished_at = Some(60);
        let progress = TaskProgress {
            task: failed,
            root_target: Some("t-1".into()),
            folders_done: 1,
            files_done: 10,
            folders_total: Some(2),
            files_total: None,
            total_size: Some(2048),
            percent: Some(40),
        };

        let text = render_progress(&progress);

        assert!(text.starts_with("#7 error src -> dst"));
        assert!(text.contains("new folder: t-1"));
        assert!(text.contains("folders: 1/2  files: 10/?"));
        assert!(text.contains("size: 2.00 KB"));
        assert!(text.contains("progress: 40%"));
        assert!(text.contains("ended: 1970-01-01T00:01:00Z"));
        assert!(text.contains("error: quota"));
    }

    #[test]
    fn already_running_mentions_resume_delay() {
        let text = render_outcome(&CopyOutcome::AlreadyRunning { task_id: 4 });
        assert!(text.starts_with("task 4 is already running"));
        assert!(text.contains("retry in a minute"));
    }

    #[test]
    fn finished_outcome_reports_counts() {
        let outcome = CopyOutcome::Finished {
            task_id: 2,
            report: RunReport {
                folders_created: 1,
                files_copied: 3,
                ..RunReport::default()
            },
        };
        let text = render_outcome(&outcome);
        assert!(text.starts_with("task 2 finished: 1 folders created, 3 files copied"));
    }
}
