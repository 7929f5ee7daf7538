use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use repairflow_errors::ErrorHandler;
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::batch::run_batch;
use commands::config::run_config;
use commands::run::run_task;
use context::{ConfigOverrides, load_config};

#[derive(Parser)]
#[command(name = "repairflow")]
#[command(about = "LLM-driven program repair over gRPC project snapshots", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Echo progress to stderr.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Override llm.model for this invocation.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Override flow.max_turns for this invocation.
    #[arg(long, global = true)]
    max_turns: Option<u64>,

    /// Directory of `<template>.txt` prompt files.
    #[arg(long, global = true)]
    prompt_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Repair a single task.
    Run(RunArgs),
    /// Repair every task under a dataset root, one after another.
    Batch(BatchArgs),
    /// Inspect the effective configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Args, Debug, Clone)]
pub(crate) struct RunArgs {
    /// Directory holding the `0N_*.txt` task inputs.
    #[arg(long)]
    pub task_dir: PathBuf,

    /// Project snapshot to repair. Defaults to `<task-dir>/premerge`, or the
    /// task directory itself when that does not exist.
    #[arg(long)]
    pub project_dir: Option<PathBuf>,

    /// Where backups, restored content and logs go.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Labels for the run log; derived from the task path when omitted.
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub task: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct BatchArgs {
    /// Root laid out as `<project>/<category>/<task>/`.
    #[arg(long)]
    pub dataset: PathBuf,

    /// Only run tasks whose `project/category/task` id contains this text.
    #[arg(long)]
    pub filter: Option<String>,

    /// Directory for per-task outputs and `batch_summary.json`.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub(crate) enum ConfigCmd {
    Show,
}

fn main() {
    let cli = Cli::parse();
    let handler = ErrorHandler::new().verbose(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("{}", handler.handle(&err));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let overrides = ConfigOverrides {
        model: cli.model,
        max_turns: cli.max_turns,
        prompt_dir: cli.prompt_dir,
    };
    let cfg = load_config(&cwd, &overrides)?;

    match cli.command {
        Commands::Run(args) => run_task(&cwd, cfg, args, cli.json, cli.verbose),
        Commands::Batch(args) => run_batch(&cwd, cfg, args, cli.json, cli.verbose),
        Commands::Config { command } => run_config(&cfg, command, cli.json),
    }
}
