use anyhow::Result;
use repairflow_core::{FileRequest, FileRequestKind, RepositoryConfig};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

/// Source of project context handed to the model.
pub trait FileRepository: Send + Sync {
    /// Contents of every `FILE_CONTENT` request, each under a `--- <path>`
    /// header, failures annotated inline.
    fn get_file_contents(&self, requests: &[FileRequest]) -> Result<String>;

    /// Indented tree of `path`, `depth` levels deep.
    fn get_directory_listing(&self, path: &str, depth: usize) -> Result<String>;

    /// Default requests when the model has asked for nothing yet.
    fn default_requests(&self, _limit: usize) -> Vec<FileRequest> {
        vec![FileRequest::directory(".")]
    }
}

const SOURCE_EXTENSIONS: &[&str] = &[
    "go", "proto", "rs", "py", "js", "ts", "java", "kt", "c", "cc", "cpp", "h", "hpp", "cs", "rb",
];
const SIMILAR_LIMIT: usize = 5;
const SEARCH_DEPTH: usize = 6;

/// Reads straight from a project snapshot on disk.
pub struct WorkspaceFileRepository {
    root: PathBuf,
    cfg: RepositoryConfig,
}

impl WorkspaceFileRepository {
    pub fn new(root: impl Into<PathBuf>, cfg: RepositoryConfig) -> Self {
        Self {
            root: root.into(),
            cfg,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, rel: &str) -> Option<PathBuf> {
        let rel = rel.trim().trim_start_matches("./");
        let rel_path = Path::new(rel);
        if rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return None;
        }
        Some(self.root.join(rel_path))
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.cfg.excluded_dirs.iter().any(|d| d == name)
    }

    fn read_entry(&self, rel: &str) -> String {
        let Some(full) = self.resolve(rel) else {
            return "[Error: path is outside the project]".to_string();
        };
        if !full.is_file() {
            return self.missing_note(rel);
        }
        let size = fs::metadata(&full).map(|m| m.len()).unwrap_or(0);
        if size > self.cfg.max_file_bytes {
            return format!(
                "[Error: file too large: {size} bytes > {} bytes]",
                self.cfg.max_file_bytes
            );
        }
        match read_with_timeout(full, Duration::from_millis(self.cfg.read_timeout_ms.max(1))) {
            ReadOutcome::Text(text) => text,
            ReadOutcome::NotText => "[Error: not a text file]".to_string(),
            ReadOutcome::TimedOut => format!(
                "[Error: read timed out after {} ms]",
                self.cfg.read_timeout_ms
            ),
            ReadOutcome::Failed(err) => format!("[Error: {err}]"),
        }
    }

    fn missing_note(&self, rel: &str) -> String {
        let mut note = format!("[Error: file not found: {rel}]");
        if let Some(hint) = self.generated_hint(rel) {
            note.push('\n');
            note.push_str(&hint);
        }
        let similar = self.similar_files(rel);
        if !similar.is_empty() {
            note.push_str("\nSimilar files:");
            for path in similar {
                note.push_str(&format!("\n  - {path}"));
            }
        }
        note
    }

    /// Hint for protoc output that is not checked in.
    fn generated_hint(&self, rel: &str) -> Option<String> {
        let name = Path::new(rel).file_name()?.to_str()?;
        let stem = generated_stem(name)?;
        let proto_name = format!("{stem}.proto");
        let protos: Vec<String> = self
            .walk_files()
            .filter(|p| Path::new(p).file_name().and_then(|n| n.to_str()) == Some(proto_name.as_str()))
            .collect();
        let mut hint = format!(
            "Note: {name} looks like a generated file; it is produced from {proto_name} and is not part of the snapshot."
        );
        if !protos.is_empty() {
            hint.push_str(&format!(" Request the source instead: {}", protos.join(", ")));
        }
        Some(hint)
    }

    fn walk_files(&self) -> impl Iterator<Item = String> + '_ {
        WalkDir::new(&self.root)
            .max_depth(SEARCH_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                e.depth() == 0
                    || !e.file_type().is_dir()
                    || !(self.is_excluded(&e.file_name().to_string_lossy())
                        || e.file_name().to_string_lossy().starts_with('.'))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(move |e| {
                e.path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
    }

    /// Closest existing paths by file name, extension and directory overlap.
    pub fn similar_files(&self, rel: &str) -> Vec<String> {
        let mut scored: Vec<(u32, String)> = self
            .walk_files()
            .filter_map(|candidate| {
                let score = similarity(rel, &candidate);
                (score > 0).then_some((score, candidate))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(SIMILAR_LIMIT)
            .map(|(_, path)| path)
            .collect()
    }

    fn render_tree(&self, dir: &Path, depth: usize) -> Vec<String> {
        let mut lines = Vec::new();
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(depth.max(1))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && self.is_excluded(&e.file_name().to_string_lossy())));
        for entry in walker.filter_map(|e| e.ok()) {
            let indent = "  ".repeat(entry.depth());
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                lines.push(format!("{indent}{name}/"));
            } else {
                lines.push(format!("{indent}{name}"));
            }
        }
        lines
    }
}

impl FileRepository for WorkspaceFileRepository {
    fn get_file_contents(&self, requests: &[FileRequest]) -> Result<String> {
        let sections: Vec<String> = requests
            .iter()
            .filter(|r| r.kind == FileRequestKind::FileContent)
            .map(|r| {
                let rel = r.path.trim().trim_start_matches("./");
                format!("--- {rel}\n{}", self.read_entry(rel))
            })
            .collect();
        Ok(sections.join("\n\n"))
    }

    fn get_directory_listing(&self, path: &str, depth: usize) -> Result<String> {
        let rel = path.trim().trim_start_matches("./").trim_end_matches('/');
        let rel = if rel.is_empty() { "." } else { rel };
        let header = format!("{rel}/");
        let Some(full) = self.resolve(rel) else {
            return Ok(format!("{header}\n[Error: path is outside the project]"));
        };
        if !full.is_dir() {
            return Ok(format!("{header}\n[Error: directory not found: {rel}]"));
        }
        let mut lines = vec![header];
        lines.extend(self.render_tree(&full, depth));
        Ok(lines.join("\n"))
    }

    /// Up to `limit` top-level source files, else a listing of the root.
    fn default_requests(&self, limit: usize) -> Vec<FileRequest> {
        let mut names: Vec<String> = fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
                    .filter_map(|e| e.file_name().to_str().map(ToString::to_string))
                    .filter(|name| {
                        name.rsplit_once('.')
                            .is_some_and(|(_, ext)| SOURCE_EXTENSIONS.contains(&ext))
                    })
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        if names.is_empty() {
            return vec![FileRequest::directory(".")];
        }
        names.into_iter().take(limit.max(1)).map(FileRequest::file).collect()
    }
}

enum ReadOutcome {
    Text(String),
    NotText,
    TimedOut,
    Failed(String),
}

fn read_with_timeout(path: PathBuf, timeout: Duration) -> ReadOutcome {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("repairflow-read".to_string())
        .spawn(move || {
            let _ = tx.send(fs::read(&path));
        });
    if let Err(err) = spawned {
        return ReadOutcome::Failed(err.to_string());
    }
    match rx.recv_timeout(timeout) {
        Ok(Ok(bytes)) => {
            if bytes.contains(&0) {
                return ReadOutcome::NotText;
            }
            match String::from_utf8(bytes) {
                Ok(text) => ReadOutcome::Text(text),
                Err(_) => ReadOutcome::NotText,
            }
        }
        Ok(Err(err)) => ReadOutcome::Failed(err.to_string()),
        Err(mpsc::RecvTimeoutError::Timeout) => ReadOutcome::TimedOut,
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            ReadOutcome::Failed("reader thread exited".to_string())
        }
    }
}

/// `foo.pb.go` / `foo_grpc.pb.go` / `foo_pb2.py` / `foo_pb2_grpc.py` -> `foo`.
fn generated_stem(name: &str) -> Option<&str> {
    if let Some(idx) = name.find(".pb.") {
        let stem = &name[..idx];
        return Some(stem.strip_suffix("_grpc").unwrap_or(stem));
    }
    let stem = name
        .strip_suffix("_pb2.py")
        .or_else(|| name.strip_suffix("_pb2_grpc.py"))?;
    Some(stem)
}

fn similarity(target: &str, candidate: &str) -> u32 {
    let split = |p: &str| -> (String, String, String, Vec<String>) {
        let path = Path::new(p);
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dirs = path
            .parent()
            .map(|d| {
                d.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        (base, ext, stem, dirs)
    };
    let (t_base, t_ext, t_stem, t_dirs) = split(target);
    let (c_base, c_ext, c_stem, c_dirs) = split(candidate);

    let mut score = 0;
    if c_base == t_base {
        score += 100;
    }
    if !t_ext.is_empty() && c_ext == t_ext {
        score += 50;
    }
    if !t_stem.is_empty() && c_stem.contains(&t_stem) {
        score += 30;
    }
    score += 10 * t_dirs.iter().zip(&c_dirs).filter(|(a, b)| a == b).count() as u32;
    let distance = strsim::levenshtein(&t_base.to_lowercase(), &c_base.to_lowercase());
    if distance < t_base.len() {
        score += 20_u32.saturating_sub(distance as u32 * 2);
    }
    score
}
