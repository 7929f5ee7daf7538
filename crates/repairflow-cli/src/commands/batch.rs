use crate::BatchArgs;
use crate::commands::run::{TaskLabels, execute, repair_task, task_output_dir};
use crate::context::{install_interrupt_flag, under};
use crate::output::print_json;
use anyhow::{Result, anyhow};
use chrono::Utc;
use repairflow_core::AppConfig;
use repairflow_observe::{RunStatus, TokenTotals};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use walkdir::WalkDir;

pub(crate) const SUMMARY_FILE: &str = "batch_summary.json";
const FAILED: &str = "Failed";

#[derive(Debug, Clone)]
pub(crate) struct DatasetTask {
    pub labels: TaskLabels,
    pub dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct BatchEntry {
    id: String,
    project: String,
    category: String,
    task: String,
    status: String,
    turns: u64,
    tokens: TokenTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_path: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize)]
struct BatchCounts {
    completed: usize,
    incomplete: usize,
    error: usize,
    failed: usize,
}

#[derive(Debug, Serialize)]
struct BatchSummary {
    dataset: PathBuf,
    started_at: String,
    finished_at: String,
    interrupted: bool,
    total_tasks: usize,
    counts: BatchCounts,
    tokens: TokenTotals,
    tasks: Vec<BatchEntry>,
}

/// Task directories three levels below the dataset root, in path order.
pub(crate) fn discover_tasks(dataset: &Path) -> Vec<DatasetTask> {
    WalkDir::new(dataset)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && !is_hidden(dataset, e.path()))
        .map(|e| DatasetTask {
            labels: TaskLabels::from_path(e.path()),
            dir: e.path().to_path_buf(),
        })
        .collect()
}

fn is_hidden(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root).is_ok_and(|rel| {
        rel.components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
    })
}

pub(crate) fn run_batch(
    cwd: &Path,
    cfg: AppConfig,
    args: BatchArgs,
    json_mode: bool,
    verbose: bool,
) -> Result<()> {
    let dataset = under(cwd, &args.dataset);
    if !dataset.is_dir() {
        return Err(anyhow!("dataset directory not found: {}", dataset.display()));
    }
    let output_root = args
        .output_dir
        .map(|dir| under(cwd, dir))
        .unwrap_or_else(|| under(cwd, &cfg.paths.output_root));
    let tasks: Vec<DatasetTask> = discover_tasks(&dataset)
        .into_iter()
        .filter(|t| {
            args.filter
                .as_deref()
                .is_none_or(|f| t.labels.id().contains(f))
        })
        .collect();

    let interrupt = install_interrupt_flag()?;
    let started_at = Utc::now().to_rfc3339();
    let mut entries = Vec::with_capacity(tasks.len());
    let mut interrupted = false;

    for (idx, dataset_task) in tasks.iter().enumerate() {
        if interrupt.load(Ordering::SeqCst) {
            interrupted = true;
            break;
        }
        if !json_mode {
            eprintln!("[{}/{}] {}", idx + 1, tasks.len(), dataset_task.labels.id());
        }
        let output_dir = task_output_dir(&output_root, &dataset_task.labels);
        let task = repair_task(
            cwd,
            &cfg,
            &dataset_task.dir,
            dataset_task.labels.clone(),
            None,
            output_dir,
        );
        let labels = &dataset_task.labels;
        let entry = match execute(&cfg, task, interrupt.clone(), verbose) {
            Ok(summary) => BatchEntry {
                id: labels.id(),
                project: labels.project.clone(),
                category: labels.category.clone(),
                task: labels.task.clone(),
                status: summary.status.as_str().to_string(),
                turns: summary.turns,
                tokens: summary.tokens,
                error: summary.error,
                log_path: summary.log_path,
            },
            Err(err) => BatchEntry {
                id: labels.id(),
                project: labels.project.clone(),
                category: labels.category.clone(),
                task: labels.task.clone(),
                status: FAILED.to_string(),
                turns: 0,
                tokens: TokenTotals::default(),
                error: Some(format!("{err:#}")),
                log_path: None,
            },
        };
        entries.push(entry);
    }
    interrupted |= interrupt.load(Ordering::SeqCst);

    let summary = summarize(dataset, started_at, interrupted, entries);
    fs::create_dir_all(&output_root)?;
    let summary_path = output_root.join(SUMMARY_FILE);
    fs::write(&summary_path, serde_json::to_vec_pretty(&summary)?)?;

    if json_mode {
        print_json(&summary)?;
    } else {
        println!(
            "{} task(s): {} completed, {} incomplete, {} error, {} failed{}",
            summary.total_tasks,
            summary.counts.completed,
            summary.counts.incomplete,
            summary.counts.error,
            summary.counts.failed,
            if summary.interrupted { " (interrupted)" } else { "" }
        );
        println!("tokens: {}", summary.tokens.total);
        println!("summary: {}", summary_path.display());
    }
    Ok(())
}

fn summarize(
    dataset: PathBuf,
    started_at: String,
    interrupted: bool,
    tasks: Vec<BatchEntry>,
) -> BatchSummary {
    let mut counts = BatchCounts::default();
    let mut tokens = TokenTotals::default();
    for entry in &tasks {
        tokens.add(entry.tokens);
        let status = entry.status.as_str();
        if status == RunStatus::CompletedExplicit.as_str()
            || status == RunStatus::CompletedImplicit.as_str()
        {
            counts.completed += 1;
        } else if status == RunStatus::Incomplete.as_str() {
            counts.incomplete += 1;
        } else if status == RunStatus::Error.as_str() {
            counts.error += 1;
        } else {
            counts.failed += 1;
        }
    }
    BatchSummary {
        dataset,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        interrupted,
        total_tasks: tasks.len(),
        counts,
        tokens,
        tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: &str, total: u64) -> BatchEntry {
        BatchEntry {
            id: "p/c/t".to_string(),
            project: "p".to_string(),
            category: "c".to_string(),
            task: "t".to_string(),
            status: status.to_string(),
            turns: 1,
            tokens: TokenTotals {
                total,
                ..TokenTotals::default()
            },
            error: None,
            log_path: None,
        }
    }

    #[test]
    fn discovers_task_directories_in_order() {
        let root = tempfile::tempdir().expect("tempdir");
        for rel in ["svc/bugs/t2/premerge", "svc/bugs/t1", "api/perf/t9", ".cache/x/y"] {
            fs::create_dir_all(root.path().join(rel)).expect("mkdir");
        }
        fs::write(root.path().join("svc/bugs/notes.txt"), "x").expect("file");
        let ids: Vec<String> = discover_tasks(root.path())
            .iter()
            .map(|t| t.labels.id())
            .collect();
        assert_eq!(ids, vec!["api/perf/t9", "svc/bugs/t1", "svc/bugs/t2"]);
    }

    #[test]
    fn summary_counts_and_totals() {
        let summary = summarize(
            PathBuf::from("data"),
            Utc::now().to_rfc3339(),
            false,
            vec![
                entry("Completed", 10),
                entry("Completed (Implicit)", 5),
                entry("Incomplete", 1),
                entry("Error", 2),
                entry(FAILED, 0),
            ],
        );
        assert_eq!(summary.total_tasks, 5);
        assert_eq!(summary.counts.completed, 2);
        assert_eq!(summary.counts.incomplete, 1);
        assert_eq!(summary.counts.error, 1);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.tokens.total, 18);
    }
}
