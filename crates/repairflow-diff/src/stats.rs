use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub total_lines: usize,
    pub added_lines: usize,
    pub deleted_lines: usize,
    pub hunks: usize,
    pub modified_files: usize,
    pub processing_time_ms: u64,
    pub backup_created: bool,
}

impl DiffStats {
    /// Counts taken from line prefixes only; the restored content is not consulted.
    pub fn from_diff(diff: &str) -> Self {
        let mut stats = Self::default();
        let lines: Vec<&str> = diff.lines().collect();
        let headers = header_flags(&lines);
        for (line, is_header) in lines.iter().zip(headers) {
            stats.total_lines += 1;
            if is_header {
                continue;
            }
            if line.starts_with("@@") {
                stats.hunks += 1;
            } else if line.starts_with('+') {
                stats.added_lines += 1;
            } else if line.starts_with('-') {
                stats.deleted_lines += 1;
            }
        }
        if stats.hunks == 0 && stats.changed_lines() > 0 {
            stats.hunks = 1;
        }
        stats.modified_files = affected_files(diff).len();
        stats
    }

    pub fn changed_lines(&self) -> usize {
        self.added_lines + self.deleted_lines
    }
}

/// Paths named by `---`/`+++` headers, in first-seen order and without duplicates.
pub fn affected_files(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let lines: Vec<&str> = diff.lines().collect();
    for (line, is_header) in lines.iter().zip(header_flags(&lines)) {
        if !is_header {
            continue;
        }
        let raw = line
            .strip_prefix("--- ")
            .or_else(|| line.strip_prefix("+++ "));
        if let Some(path) = raw.and_then(parse_patch_path)
            && !files.contains(&path)
        {
            files.push(path);
        }
    }
    files
}

/// Marks file header lines: a `--- ` line directly followed by `+++ `, and that
/// `+++ ` line. A removed `-- comment` line renders as `--- comment` but has no
/// `+++ ` partner.
pub(crate) fn header_flags(lines: &[&str]) -> Vec<bool> {
    let mut flags = vec![false; lines.len()];
    for idx in 0..lines.len().saturating_sub(1) {
        if lines[idx].starts_with("--- ") && lines[idx + 1].starts_with("+++ ") {
            flags[idx] = true;
            flags[idx + 1] = true;
        }
    }
    flags
}

/// Normalize a header path: drop a trailing timestamp and the a/ b/ prefixes.
/// `/dev/null` yields `None`.
pub fn parse_patch_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return None;
    }
    let normalized = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    if normalized.is_empty() {
        return None;
    }
    Some(normalized.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_changes_and_files() {
        let diff = "--- a/x.go\n+++ b/x.go\n@@ -1,2 +1,2 @@\n ctx\n-old\n+new\n+more\n--- /dev/null\n+++ b/y.go\n@@ -0,0 +1 @@\n+fresh\n";
        let stats = DiffStats::from_diff(diff);
        assert_eq!(stats.added_lines, 3);
        assert_eq!(stats.deleted_lines, 1);
        assert_eq!(stats.hunks, 2);
        assert_eq!(stats.modified_files, 2);
        assert_eq!(stats.total_lines, 11);
    }

    #[test]
    fn headerless_changes_count_as_one_hunk() {
        let stats = DiffStats::from_diff("-a\n+b\n");
        assert_eq!(stats.hunks, 1);
        assert_eq!(DiffStats::from_diff(" context only\n").hunks, 0);
    }

    #[test]
    fn header_paths_are_normalized() {
        assert_eq!(
            parse_patch_path("a/src/main.go\t2024-01-01 00:00:00"),
            Some("src/main.go".to_string())
        );
        assert_eq!(parse_patch_path("/dev/null"), None);
        assert_eq!(
            affected_files("--- a/p.go\n+++ b/p.go\n--- a/q.go\n+++ b/q.go\n"),
            vec!["p.go".to_string(), "q.go".to_string()]
        );
    }

    #[test]
    fn removed_comment_lines_are_not_headers() {
        let diff = "--- a/schema.sql\n+++ b/schema.sql\n@@ -1,2 +1,1 @@\n--- legacy column\n CREATE TABLE t (id INT);\n";
        assert_eq!(affected_files(diff), vec!["schema.sql".to_string()]);
        let stats = DiffStats::from_diff(diff);
        assert_eq!(stats.deleted_lines, 1);
        assert_eq!(stats.modified_files, 1);
    }
}
