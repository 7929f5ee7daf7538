use crate::stats::{DiffStats, header_flags};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub applied_change_count: usize,
    pub skipped_change_count: usize,
}

/// Check restored content for merge debris and encoding damage, and note
/// suspicious but acceptable diffs as warnings.
pub fn validate(diff: &str, restored: &str) -> DiffValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let conflict_lines = restored
        .lines()
        .filter(|l| l.starts_with("<<<<<<<") || l.starts_with(">>>>>>>"))
        .count();
    if conflict_lines > 0 {
        errors.push(format!(
            "Restored content contains {conflict_lines} conflict marker line(s)"
        ));
    }
    if restored.contains('\u{FFFD}') || restored.contains('\0') {
        errors.push("Restored content is not valid text (replacement or NUL characters)".to_string());
    }

    if diff.trim().is_empty() {
        warnings.push("Diff is empty".to_string());
    }
    if restored.trim().is_empty() {
        warnings.push("Restored content is empty".to_string());
    }
    let stats = DiffStats::from_diff(diff);
    if !diff.trim().is_empty() && stats.changed_lines() == 0 {
        warnings.push("No actual changes detected in diff".to_string());
    }
    let skipped = context_only_hunks(diff);
    if skipped > 0 {
        warnings.push(format!("{skipped} hunk(s) contain only context lines"));
    }

    DiffValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        applied_change_count: stats.changed_lines(),
        skipped_change_count: skipped,
    }
}

fn context_only_hunks(diff: &str) -> usize {
    let mut count = 0;
    let mut in_hunk = false;
    let mut changed = false;
    let lines: Vec<&str> = diff.lines().collect();
    for (line, is_header) in lines.iter().zip(header_flags(&lines)) {
        let boundary = line.starts_with("@@")
            || line.starts_with("diff ")
            || (is_header && line.starts_with("--- "));
        if boundary {
            if in_hunk && !changed {
                count += 1;
            }
            in_hunk = line.starts_with("@@");
            changed = false;
        } else if in_hunk && (line.starts_with('+') || line.starts_with('-')) {
            changed = true;
        }
    }
    if in_hunk && !changed {
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "--- a/x.go\n+++ b/x.go\n@@ -1 +1 @@\n-a\n+b\n";

    #[test]
    fn conflict_markers_invalidate() {
        let result = validate(DIFF, "--- x.go\n<<<<<<< HEAD\nb\n=======\na\n>>>>>>> other\n");
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("2 conflict marker"));
    }

    #[test]
    fn bad_encoding_invalidates() {
        assert!(!validate(DIFF, "--- x.go\nb\u{FFFD}\n").is_valid);
        assert!(!validate(DIFF, "--- x.go\nb\0\n").is_valid);
    }

    #[test]
    fn empty_restored_content_is_only_a_warning() {
        let result = validate(DIFF, "");
        assert!(result.is_valid);
        assert_eq!(result.warnings, vec!["Restored content is empty".to_string()]);
        assert_eq!(result.applied_change_count, 2);
    }

    #[test]
    fn context_only_hunks_are_flagged() {
        let diff = "--- a/x.go\n+++ b/x.go\n@@ -1 +1 @@\n same\n";
        let result = validate(diff, "--- x.go\nsame\n");
        assert!(result.is_valid);
        assert_eq!(result.skipped_change_count, 1);
        assert!(
            result
                .warnings
                .contains(&"No actual changes detected in diff".to_string())
        );
    }

    #[test]
    fn removed_comment_line_counts_as_a_change() {
        let diff = "--- a/q.sql\n+++ b/q.sql\n@@ -1,2 +1 @@\n--- drop me\n SELECT 1;\n";
        let result = validate(diff, "--- q.sql\nSELECT 1;\n");
        assert_eq!(result.skipped_change_count, 0);
        assert_eq!(result.applied_change_count, 1);
        assert!(result.warnings.is_empty());
    }
}
