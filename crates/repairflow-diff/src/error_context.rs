use crate::stats::affected_files;
use repairflow_core::ProcessingPhase;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the controller was when an apply failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemSnapshot {
    pub phase: ProcessingPhase,
    pub turn: u64,
    pub error_count: u32,
}

impl SystemSnapshot {
    pub fn describe(&self) -> String {
        format!(
            "Phase: {}, Turn: {}, Errors: {}",
            self.phase.as_str(),
            self.turn,
            self.error_count
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub diff_preview: String,
    pub affected_files: Vec<String>,
    pub system_state: String,
    pub possible_causes: Vec<String>,
}

impl ErrorContext {
    pub fn build(message: &str, diff: &str, snapshot: &SystemSnapshot, preview_chars: usize) -> Self {
        Self {
            diff_preview: preview(diff, preview_chars),
            affected_files: affected_files(diff),
            system_state: snapshot.describe(),
            possible_causes: possible_causes(message),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Diff preview: {}", self.diff_preview)?;
        if self.affected_files.is_empty() {
            writeln!(f, "Affected files: (none detected)")?;
        } else {
            writeln!(f, "Affected files: {}", self.affected_files.join(", "))?;
        }
        writeln!(f, "System state: {}", self.system_state)?;
        writeln!(f, "Possible causes:")?;
        for cause in &self.possible_causes {
            writeln!(f, "- {cause}")?;
        }
        Ok(())
    }
}

fn preview(diff: &str, limit: usize) -> String {
    let mut chars = diff.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

const CAUSES: &[(&[&str], &str)] = &[
    (
        &["enoent", "not found", "no such file"],
        "File not found - target file may not exist",
    ),
    (
        &["eacces", "permission"],
        "Permission denied - check file permissions",
    ),
    (
        &["diff", "patch", "hunk"],
        "Invalid diff format - patch may be malformed",
    ),
    (
        &["line"],
        "Line number mismatch - file may have been modified",
    ),
];

/// Candidate causes, by substring of the lowercased failure message.
pub fn possible_causes(message: &str) -> Vec<String> {
    let lower = message.to_lowercase();
    let causes: Vec<String> = CAUSES
        .iter()
        .filter(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, cause)| cause.to_string())
        .collect();
    if causes.is_empty() {
        vec!["Unknown error - check logs for details".to_string()]
    } else {
        causes
    }
}
