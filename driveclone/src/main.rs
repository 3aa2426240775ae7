use clap::Parser;
use driveclone::cli::{
    Cli, Commands, TaskAction, render_outcome, render_progress, render_summary, render_task_line,
};
use driveclone::config::CloneConfig;
use driveclone::logging;
use driveclone::service::CloneService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init();
    let cli = Cli::parse();
    let config = CloneConfig::from_env()?;
    let service = CloneService::bootstrap(&config).await?;

    match cli.command {
        Commands::Count { source, update } => {
            let summary = service.summary(&source, update).await?;
            println!("{}", render_summary(&source, &summary));
        }
        Commands::Copy {
            source,
            target,
            update,
        } => {
            let outcome = service.copy(&source, target.as_deref(), update).await?;
            println!("{}", render_outcome(&outcome));
        }
        Commands::Task { action } => match action {
            None => print_tasks(&service.active_tasks().await?, "no active tasks"),
            Some(TaskAction::All) => print_tasks(&service.list_tasks().await?, "no tasks"),
            Some(TaskAction::Show { id }) => {
                println!("{}", render_progress(&service.task_progress(id).await?));
            }
            Some(TaskAction::Clear) => {
                let removed = service.clear_finished_tasks().await?;
                println!("removed {removed} finished tasks");
            }
            Some(TaskAction::Rm { id }) => {
                service.remove_task(id).await?;
                println!("task {id} removed");
            }
        },
    }
    Ok(())
}

fn print_tasks(tasks: &[driveclone::replicate::TaskRecord], empty: &str) {
    if tasks.is_empty() {
        println!("{empty}");
    }
    for task in tasks {
        println!("{}", render_task_line(task));
    }
}
