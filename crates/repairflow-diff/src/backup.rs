use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MANIFEST_NAME: &str = "backup_info.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpFile {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Manifest of one pre-apply snapshot. Never removed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_dir: PathBuf,
    pub timestamp: String,
    pub files: Vec<BackedUpFile>,
    pub total_bytes: u64,
}

impl BackupRecord {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }
}

/// Which files under the project root get copied.
pub struct BackupScope<'a> {
    pub extensions: &'a [String],
    pub excluded_dirs: &'a [String],
    /// Skipped when it lies inside the project root.
    pub output_dir: &'a Path,
}

/// Copy every matching file into a fresh `<backups_root>/<timestamp>` directory
/// and write its manifest last.
pub fn create_backup(project_root: &Path, backups_root: &Path, scope: &BackupScope<'_>) -> Result<BackupRecord> {
    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string();
    let backup_dir = unique_dir(backups_root, &timestamp);
    fs::create_dir_all(&backup_dir)
        .with_context(|| format!("failed to create backup dir {}", backup_dir.display()))?;

    let walker = WalkDir::new(project_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let path = entry.path();
            if path.starts_with(scope.output_dir) || path.starts_with(backups_root) {
                return false;
            }
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !scope.excluded_dirs.iter().any(|d| d == name.as_ref())
        });

    let mut files = Vec::new();
    let mut total_bytes = 0_u64;
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() || !has_extension(entry.path(), scope.extensions) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(project_root)
            .unwrap_or(entry.path());
        let bytes = fs::read(entry.path())
            .with_context(|| format!("failed to read {} for backup", entry.path().display()))?;
        let dest = backup_dir.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, &bytes)
            .with_context(|| format!("failed to write backup copy {}", dest.display()))?;
        total_bytes += bytes.len() as u64;
        files.push(BackedUpFile {
            path: rel.to_string_lossy().replace('\\', "/"),
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let record = BackupRecord {
        backup_dir: backup_dir.clone(),
        timestamp,
        files,
        total_bytes,
    };
    fs::write(
        backup_dir.join(MANIFEST_NAME),
        serde_json::to_vec_pretty(&record)?,
    )?;
    Ok(record)
}

fn unique_dir(root: &Path, stamp: &str) -> PathBuf {
    let first = root.join(stamp);
    if !first.exists() {
        return first;
    }
    let mut n = 1;
    loop {
        let candidate = root.join(format!("{stamp}-{n}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
