use crate::RunArgs;
use crate::context::{build_clients, install_interrupt_flag, under};
use crate::output::print_json;
use anyhow::{Result, anyhow};
use repairflow_agent::{FlowController, RepairTask, RunSummary};
use repairflow_core::AppConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

const SNAPSHOT_DIR: &str = "premerge";

/// Run-log labels of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskLabels {
    pub project: String,
    pub category: String,
    pub task: String,
}

impl TaskLabels {
    /// `<project>/<category>/<task>` taken from the last three path components.
    pub(crate) fn from_path(task_dir: &Path) -> Self {
        let mut names = task_dir
            .components()
            .rev()
            .filter_map(|c| c.as_os_str().to_str())
            .map(ToString::to_string);
        let task = names.next().unwrap_or_else(|| "task".to_string());
        let category = names.next().unwrap_or_else(|| "default".to_string());
        let project = names.next().unwrap_or_else(|| "default".to_string());
        Self {
            project,
            category,
            task,
        }
    }

    pub(crate) fn id(&self) -> String {
        format!("{}/{}/{}", self.project, self.category, self.task)
    }
}

/// The snapshot lives in `premerge/` when present, else the task directory is the snapshot.
pub(crate) fn snapshot_dir(task_dir: &Path) -> PathBuf {
    let premerge = task_dir.join(SNAPSHOT_DIR);
    if premerge.is_dir() {
        premerge
    } else {
        task_dir.to_path_buf()
    }
}

/// Each task gets its own `<root>/<project>/<category>/<task>` output directory.
pub(crate) fn task_output_dir(output_root: &Path, labels: &TaskLabels) -> PathBuf {
    output_root
        .join(&labels.project)
        .join(&labels.category)
        .join(&labels.task)
}

pub(crate) fn repair_task(
    cwd: &Path,
    cfg: &AppConfig,
    task_dir: &Path,
    labels: TaskLabels,
    project_dir: Option<PathBuf>,
    output_dir: PathBuf,
) -> RepairTask {
    RepairTask {
        project_dir: project_dir.unwrap_or_else(|| snapshot_dir(task_dir)),
        input_dir: Some(task_dir.to_path_buf()),
        output_dir,
        log_root: under(cwd, &cfg.paths.log_root),
        project: labels.project,
        category: labels.category,
        task: labels.task,
    }
}

/// Build the HTTP clients and drive one task to End.
pub(crate) fn execute(
    cfg: &AppConfig,
    task: RepairTask,
    interrupt: Arc<AtomicBool>,
    verbose: bool,
) -> Result<RunSummary> {
    let (primary, secondary) = build_clients(cfg)?;
    let mut flow = FlowController::builder(cfg.clone(), task)
        .primary(primary)
        .secondary(secondary)
        .interrupt(interrupt)
        .verbose(verbose)
        .build()?;
    flow.run()
}

pub(crate) fn run_task(
    cwd: &Path,
    cfg: AppConfig,
    args: RunArgs,
    json_mode: bool,
    verbose: bool,
) -> Result<()> {
    let task_dir = under(cwd, &args.task_dir);
    if !task_dir.is_dir() {
        return Err(anyhow!("task directory not found: {}", task_dir.display()));
    }
    let derived = TaskLabels::from_path(&task_dir);
    let labels = TaskLabels {
        project: args.project.unwrap_or(derived.project),
        category: args.category.unwrap_or(derived.category),
        task: args.task.unwrap_or(derived.task),
    };
    let project_dir = args.project_dir.map(|dir| under(cwd, dir));
    if let Some(dir) = &project_dir
        && !dir.is_dir()
    {
        return Err(anyhow!("project directory not found: {}", dir.display()));
    }

    let output_dir = match args.output_dir {
        Some(dir) => under(cwd, dir),
        None => task_output_dir(&under(cwd, &cfg.paths.output_root), &labels),
    };
    let task = repair_task(cwd, &cfg, &task_dir, labels, project_dir, output_dir);

    let interrupt = install_interrupt_flag()?;
    let summary = execute(&cfg, task, interrupt, verbose)?;
    if json_mode {
        print_json(&summary)?;
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("status: {}", summary.status.as_str());
    println!("turns: {}", summary.turns);
    println!(
        "tokens: {} (prompt {}, completion {}, summary {})",
        summary.tokens.total,
        summary.tokens.prompt_tokens,
        summary.tokens.completion_tokens,
        summary.tokens.summary_tokens
    );
    println!("transport: {}", summary.transport);
    if let Some(path) = &summary.log_path {
        println!("log: {}", path.display());
    }
    if let Some(error) = &summary.error {
        println!("error: {error}");
    }
}
