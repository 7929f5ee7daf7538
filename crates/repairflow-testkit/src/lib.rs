//! Test doubles shared by the integration tests of the other crates.

use anyhow::{Result, anyhow};
use repairflow_core::{ChatMessage, ChatRequest, LlmResponse, TokenUsage};
use repairflow_diff::PatchEngine;
use repairflow_llm::{LlmClient, LlmError};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Text(String),
    /// Text cut off by the output token limit.
    Truncated(String),
    Fail(LlmError),
}

impl From<&str> for Scripted {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Replays a fixed list of replies and records every request it receives.
pub struct ScriptedLlm {
    name: String,
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scripted>,
    {
        Self {
            name: "scripted".to_string(),
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Content of the last user message of request `idx`.
    pub fn last_user_prompt(&self, idx: usize) -> Option<String> {
        let requests = self.requests();
        requests.get(idx)?.messages.iter().rev().find_map(|m| match m {
            ChatMessage::User { content } => Some(content.clone()),
            _ => None,
        })
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl LlmClient for ScriptedLlm {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("scripted llm mutex poisoned"))?
            .push(req.clone());
        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("scripted llm mutex poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted llm exhausted"))?;
        let (text, finish_reason) = match next {
            Scripted::Text(text) => (text, "stop"),
            Scripted::Truncated(text) => (text, "length"),
            Scripted::Fail(err) => return Err(err.into()),
        };
        Ok(LlmResponse {
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: (text.len() as u64).div_ceil(4),
            },
            text,
            finish_reason: finish_reason.to_string(),
            model: self.name.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Patch engine that always fails with the given message.
pub struct FailingPatchEngine {
    message: String,
    calls: AtomicUsize,
}

impl FailingPatchEngine {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PatchEngine for FailingPatchEngine {
    fn apply(&self, _diff: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("{}", self.message))
    }
}

/// A throwaway project tree plus a task input directory.
pub struct Fixture {
    _guard: tempfile::TempDir,
    pub root: PathBuf,
    pub project: PathBuf,
    pub task: PathBuf,
    pub output: PathBuf,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let guard = tempfile::Builder::new()
            .prefix(&format!("repairflow-fixture-{}-", uuid::Uuid::now_v7()))
            .tempdir()?;
        let root = guard.path().to_path_buf();
        let project = root.join("project");
        let task = root.join("task");
        let output = root.join("output");
        fs::create_dir_all(&project)?;
        fs::create_dir_all(&task)?;
        Ok(Self {
            _guard: guard,
            root,
            project,
            task,
            output,
        })
    }

    /// Write a project file, creating parent directories.
    pub fn file(self, rel: &str, content: &str) -> Result<Self> {
        write_file(&self.project, rel, content)?;
        Ok(self)
    }

    /// Write one of the `0N_*.txt` task inputs.
    pub fn input(self, name: &str, content: &str) -> Result<Self> {
        write_file(&self.task, name, content)?;
        Ok(self)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        Ok(fs::read_to_string(self.project.join(rel))?)
    }
}

fn write_file(base: &Path, rel: &str, content: &str) -> Result<()> {
    let path = base.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}
