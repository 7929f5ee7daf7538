//! Applying a model-proposed diff: backup, restore, validate, report.

mod backup;
mod engine;
mod error_context;
mod stats;
mod validate;

pub use backup::{BackedUpFile, BackupRecord, BackupScope, MANIFEST_NAME, create_backup};
pub use engine::RestorePatchEngine;
pub use error_context::{ErrorContext, SystemSnapshot, possible_causes};
pub use stats::{DiffStats, affected_files, parse_patch_path};
pub use validate::{DiffValidationResult, validate};

use anyhow::Result;
use repairflow_core::DiffConfig;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Turns a unified diff into restored post-change content.
pub trait PatchEngine: Send + Sync {
    fn apply(&self, diff: &str) -> Result<String>;

    fn name(&self) -> &str {
        "patch-engine"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Backup,
    Engine,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyFailure {
    pub kind: FailureKind,
    pub message: String,
    pub context: ErrorContext,
}

/// Everything one apply attempt produced.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub stats: DiffStats,
    pub validation: DiffValidationResult,
    pub backup: Option<BackupRecord>,
    pub restored: String,
    pub artifact: Option<PathBuf>,
    pub failure: Option<ApplyFailure>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// First `limit` characters of the restored content.
    pub fn restored_preview(&self, limit: usize) -> String {
        let mut chars = self.restored.chars();
        let head: String = chars.by_ref().take(limit).collect();
        if chars.next().is_some() {
            format!("{head}\n... (truncated)")
        } else {
            head
        }
    }
}

pub struct DiffApplier {
    project_root: PathBuf,
    output_dir: PathBuf,
    cfg: DiffConfig,
    engine: Arc<dyn PatchEngine>,
}

impl DiffApplier {
    pub fn new(
        project_root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        cfg: DiffConfig,
        engine: Arc<dyn PatchEngine>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            output_dir: output_dir.into(),
            cfg,
            engine,
        }
    }

    pub fn backups_root(&self) -> PathBuf {
        self.output_dir.join("backups")
    }

    pub fn restored_root(&self) -> PathBuf {
        self.output_dir.join("restored")
    }

    /// One apply attempt. Failures are reported in the returned value; the
    /// project tree itself is never written.
    pub fn apply(&self, diff: &str, snapshot: &SystemSnapshot) -> ApplyReport {
        let started = Instant::now();
        let mut stats = DiffStats::from_diff(diff);
        let mut report = ApplyReport {
            stats,
            validation: DiffValidationResult::default(),
            backup: None,
            restored: String::new(),
            artifact: None,
            failure: None,
        };

        let scope = BackupScope {
            extensions: &self.cfg.backup_extensions,
            excluded_dirs: &self.cfg.excluded_dirs,
            output_dir: &self.output_dir,
        };
        match create_backup(&self.project_root, &self.backups_root(), &scope) {
            Ok(record) => {
                stats.backup_created = true;
                report.backup = Some(record);
            }
            Err(err) => {
                let message = format!("backup failed: {err:#}");
                report.failure = Some(self.failure(FailureKind::Backup, message, diff, snapshot));
                return self.finish(report, stats, started);
            }
        }

        let restored = match self.engine.apply(diff) {
            Ok(restored) => restored,
            Err(err) => {
                let message = format!("{err:#}");
                report.failure = Some(self.failure(FailureKind::Engine, message, diff, snapshot));
                return self.finish(report, stats, started);
            }
        };

        report.validation = validate(diff, &restored);
        report.restored = restored;
        if !report.validation.is_valid {
            let message = report.validation.errors.join("; ");
            report.failure = Some(self.failure(FailureKind::Validation, message, diff, snapshot));
            return self.finish(report, stats, started);
        }

        match write_artifact(&self.restored_root(), snapshot.turn, &report.restored) {
            Ok(path) => report.artifact = Some(path),
            Err(err) => report
                .validation
                .warnings
                .push(format!("restored content was not saved: {err:#}")),
        }
        self.finish(report, stats, started)
    }

    fn failure(
        &self,
        kind: FailureKind,
        message: String,
        diff: &str,
        snapshot: &SystemSnapshot,
    ) -> ApplyFailure {
        let context = ErrorContext::build(&message, diff, snapshot, self.cfg.preview_chars);
        ApplyFailure {
            kind,
            message,
            context,
        }
    }

    fn finish(&self, mut report: ApplyReport, mut stats: DiffStats, started: Instant) -> ApplyReport {
        stats.processing_time_ms = started.elapsed().as_millis() as u64;
        report.stats = stats;
        report
    }
}

fn write_artifact(dir: &Path, turn: u64, restored: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("turn-{turn}.txt"));
    fs::write(&path, restored)?;
    Ok(path)
}
