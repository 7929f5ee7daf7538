use anyhow::{Result, anyhow};
use chrono::Utc;
use repairflow_core::{
    ConversationState, MODIFIED_MARKER, ParsedResponse, ProcessingPhase, TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "Completed")]
    CompletedExplicit,
    #[serde(rename = "Completed (Implicit)")]
    CompletedImplicit,
    Incomplete,
    Error,
}

impl RunStatus {
    /// Label used in the run log and the batch summary.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompletedExplicit => "Completed",
            Self::CompletedImplicit => "Completed (Implicit)",
            Self::Incomplete => "Incomplete",
            Self::Error => "Error",
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(self, Self::CompletedExplicit | Self::CompletedImplicit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequestRecord {
    /// Name of the prompt template the request was rendered from.
    pub template: String,
    pub prompt: String,
    pub message_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponseRecord {
    pub raw_content: String,
    pub parsed_content: ParsedResponse,
    pub usage: TokenUsage,
    pub finish_reason: String,
    pub transport: String,
    pub quality_score: i32,
    pub attempts: u32,
}

/// One prompt/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u64,
    pub timestamp: String,
    pub state: ConversationState,
    pub phase: ProcessingPhase,
    pub llm_request: LlmRequestRecord,
    pub llm_response: LlmResponseRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_action: Option<String>,
}

impl TurnRecord {
    fn proposed_modification(&self) -> bool {
        self.llm_response.parsed_content.has_diff()
            || self.llm_response.raw_content.contains(MODIFIED_MARKER)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub summary_tokens: u64,
    pub total: u64,
}

impl TokenTotals {
    pub fn new(conversation: TokenUsage, summary: TokenUsage) -> Self {
        let summary_tokens = summary.total();
        Self {
            prompt_tokens: conversation.prompt_tokens,
            completion_tokens: conversation.completion_tokens,
            summary_tokens,
            total: conversation.total().saturating_add(summary_tokens),
        }
    }

    pub fn add(&mut self, other: TokenTotals) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.summary_tokens += other.summary_tokens;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub experiment_id: String,
    pub project: String,
    pub category: String,
    pub task: String,
    pub start_time: String,
    pub end_time: String,
    pub status: RunStatus,
    pub total_turns: u64,
    pub total_tokens: TokenTotals,
    pub provider: String,
    pub model: String,
    pub final_transport: String,
    pub final_state: ConversationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sink for the per-task interaction log.
pub trait RunLog {
    fn append_turn(&mut self, record: TurnRecord) -> Result<()>;
    fn turns(&self) -> &[TurnRecord];
    /// Write the final artifact. Called once per run.
    fn finalize(&mut self, metadata: RunMetadata) -> Result<PathBuf>;
}

/// Status when the run ends: explicit completion wins, then errors, then
/// an implicit completion if any turn proposed a modification.
pub fn resolve_final_status(completion_seen: bool, errored: bool, turns: &[TurnRecord]) -> RunStatus {
    if completion_seen {
        RunStatus::CompletedExplicit
    } else if errored {
        RunStatus::Error
    } else if turns.iter().any(TurnRecord::proposed_modification) {
        RunStatus::CompletedImplicit
    } else {
        RunStatus::Incomplete
    }
}

#[derive(Serialize)]
struct LogDocument<'a> {
    experiment_metadata: &'a RunMetadata,
    interaction_log: &'a [TurnRecord],
}

/// Writes `<root>/<project>/<category>/<task>/<timestamp>.log` as pretty JSON.
pub struct JsonRunLogger {
    path: PathBuf,
    turns: Vec<TurnRecord>,
    finalized: bool,
}

impl JsonRunLogger {
    pub fn new(log_root: &Path, project: &str, category: &str, task: &str) -> Self {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let path = log_root
            .join(project)
            .join(category)
            .join(task)
            .join(format!("{stamp}.log"));
        Self {
            path,
            turns: Vec::new(),
            finalized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunLog for JsonRunLogger {
    fn append_turn(&mut self, record: TurnRecord) -> Result<()> {
        self.turns.push(record);
        Ok(())
    }

    fn turns(&self) -> &[TurnRecord] {
        &self.turns
    }

    fn finalize(&mut self, metadata: RunMetadata) -> Result<PathBuf> {
        if self.finalized {
            return Err(anyhow!("run log already finalized: {}", self.path.display()));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let doc = LogDocument {
            experiment_metadata: &metadata,
            interaction_log: &self.turns,
        };
        fs::write(&self.path, serde_json::to_vec_pretty(&doc)?)?;
        self.finalized = true;
        Ok(self.path.clone())
    }
}
