mod run_log;

pub use run_log::{
    JsonRunLogger, LlmRequestRecord, LlmResponseRecord, RunLog, RunMetadata, RunStatus,
    TokenTotals, TurnRecord, resolve_final_status,
};

use anyhow::Result;
use chrono::Utc;
use repairflow_core::{ConversationState, runtime_dir};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Notable things that happen during a run, written as `EVENT` lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    StateEntered {
        turn: u64,
        state: ConversationState,
    },
    ResponseScored {
        attempt: u32,
        score: i32,
        transport: String,
    },
    TransportSwitched {
        from: String,
        to: String,
        reason: String,
    },
    ContextCompressed {
        before_tokens: u64,
        after_tokens: u64,
        forced: bool,
    },
    CompressionFailed {
        reason: String,
    },
    DiffApplied {
        turn: u64,
        files: usize,
        added: usize,
        deleted: usize,
    },
    DiffFailed {
        turn: u64,
        message: String,
    },
    RunFinished {
        status: RunStatus,
        turns: u64,
    },
}

pub struct Observer {
    log_path: Option<PathBuf>,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: Some(dir.join("observe.log")),
            verbose: false,
        })
    }

    /// Observer that only writes warnings to stderr.
    pub fn silent() -> Self {
        Self {
            log_path: None,
            verbose: false,
        }
    }

    pub fn record_event(&self, event: &RunEvent) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a message to stderr with `[repairflow]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[repairflow] {msg}");
        }
        let _ = self.append_log_line(&format!("{} INFO {msg}", Utc::now().to_rfc3339()));
    }

    /// Log a warning: always written to log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[repairflow WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
