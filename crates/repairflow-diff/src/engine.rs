use crate::PatchEngine;
use crate::stats::parse_patch_path;
use anyhow::{Result, anyhow};
use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

static HUNK_HEADER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").ok());

#[derive(Debug, Default)]
struct FilePatch {
    old_path: Option<String>,
    new_path: Option<String>,
    hunks: Vec<Hunk>,
}

impl FilePatch {
    fn display_path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Default)]
struct Hunk {
    old_start: usize,
    old: Vec<String>,
    new: Vec<String>,
}

/// Rebuilds post-change content of every file a diff touches, in memory.
///
/// The project tree is only read. The result lists each file under a
/// `--- <path>` header.
pub struct RestorePatchEngine {
    root: PathBuf,
}

impl RestorePatchEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Join `rel` under the root; absolute paths and `..` are refused.
    fn contained(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(anyhow!("path is outside the project: {rel}"));
        }
        Ok(self.root.join(rel_path))
    }

    fn original_lines(&self, patch: &FilePatch) -> Result<Vec<String>> {
        if let Some(new) = patch.new_path.as_deref() {
            self.contained(new)?;
        }
        let Some(old) = patch.old_path.as_deref() else {
            return Ok(Vec::new());
        };
        let target = patch.new_path.as_deref().unwrap_or(old);
        let full = self.contained(target)?;
        if !full.is_file() {
            let fallback = self.contained(old)?;
            if !fallback.is_file() {
                return Err(anyhow!(
                    "ENOENT: no such file or directory, open '{}'",
                    full.display()
                ));
            }
            return read_lines(&fallback);
        }
        read_lines(&full)
    }
}

impl PatchEngine for RestorePatchEngine {
    fn apply(&self, diff: &str) -> Result<String> {
        let patches = parse_file_patches(diff);
        if patches.is_empty() {
            return Err(anyhow!("diff contains no file headers"));
        }
        let mut sections = Vec::with_capacity(patches.len());
        for patch in &patches {
            let mut lines = self.original_lines(patch)?;
            if patch.new_path.is_some() {
                apply_hunks(&mut lines, patch)?;
            } else {
                lines.clear();
            }
            let mut body = lines.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            sections.push(format!("--- {}\n{}", patch.display_path(), body));
        }
        Ok(sections.join("\n"))
    }

    fn name(&self) -> &str {
        "restore"
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read {}: {err}", path.display()))?;
    Ok(content.lines().map(ToString::to_string).collect())
}

fn parse_file_patches(diff: &str) -> Vec<FilePatch> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut hunk: Option<Hunk> = None;
    let mut lines = diff.lines().peekable();

    while let Some(line) = lines.next() {
        // Only a `---` line directly followed by `+++` opens a file section.
        if let Some(old) = line.strip_prefix("--- ")
            && let Some(new) = lines.peek().and_then(|next| next.strip_prefix("+++ "))
        {
            close_hunk(&mut patches, &mut hunk);
            patches.push(FilePatch {
                old_path: parse_patch_path(old),
                new_path: parse_patch_path(new),
                hunks: Vec::new(),
            });
            lines.next();
            continue;
        }
        if line.starts_with("@@") {
            close_hunk(&mut patches, &mut hunk);
            if patches.is_empty() {
                continue;
            }
            let old_start = LazyLock::force(&HUNK_HEADER)
                .as_ref()
                .and_then(|re| re.captures(line))
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .unwrap_or(1);
            hunk = Some(Hunk {
                old_start,
                ..Hunk::default()
            });
            continue;
        }
        let Some(h) = hunk.as_mut() else {
            continue;
        };
        let mut ended = false;
        if let Some(rest) = line.strip_prefix('-') {
            h.old.push(rest.to_string());
        } else if let Some(rest) = line.strip_prefix('+') {
            h.new.push(rest.to_string());
        } else if let Some(rest) = line.strip_prefix(' ') {
            h.old.push(rest.to_string());
            h.new.push(rest.to_string());
        } else if line.is_empty() {
            h.old.push(String::new());
            h.new.push(String::new());
        } else if !line.starts_with('\\') {
            ended = true;
        }
        if ended {
            close_hunk(&mut patches, &mut hunk);
        }
    }
    close_hunk(&mut patches, &mut hunk);
    patches
}

fn close_hunk(patches: &mut [FilePatch], hunk: &mut Option<Hunk>) {
    if let Some(done) = hunk.take()
        && let Some(file) = patches.last_mut()
    {
        file.hunks.push(done);
    }
}

fn apply_hunks(lines: &mut Vec<String>, patch: &FilePatch) -> Result<()> {
    let mut offset: isize = 0;
    for hunk in &patch.hunks {
        let hint = (hunk.old_start.saturating_sub(1) as isize + offset).max(0) as usize;
        let at = locate(lines, &hunk.old, hint).ok_or_else(|| {
            anyhow!(
                "hunk mismatch in {}: expected \"{}\" near line {}",
                patch.display_path(),
                hunk.old.first().map(String::as_str).unwrap_or(""),
                hunk.old_start
            )
        })?;
        lines.splice(at..at + hunk.old.len(), hunk.new.iter().cloned());
        offset += hunk.new.len() as isize - hunk.old.len() as isize;
    }
    Ok(())
}

/// Position of `needle` in `lines` closest to `hint`, comparing without
/// trailing whitespace.
fn locate(lines: &[String], needle: &[String], hint: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(hint.min(lines.len()));
    }
    if needle.len() > lines.len() {
        return None;
    }
    let last = lines.len() - needle.len();
    let matches_at = |pos: usize| {
        lines[pos..pos + needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| a.trim_end() == b.trim_end())
    };
    let hint = hint.min(last);
    (0..=last)
        .flat_map(|d| {
            let below = hint.checked_sub(d);
            let above = (d > 0).then_some(hint + d);
            below.into_iter().chain(above)
        })
        .filter(|&pos| pos <= last)
        .find(|&pos| matches_at(pos))
}
