use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

/// Completion marker the model emits once the repair is finished.
pub const COMPLETION_MARKER: &str = "%%_Fin_%%";
/// Section marker announcing a proposed diff.
pub const MODIFIED_MARKER: &str = "%_Modified_%";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".repairflow")
}

/// States of the repair conversation. `End` is the single terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationState {
    Start,
    PrepareContext,
    SendInitial,
    AnalyzePlan,
    Decision,
    AnalyzeRequest,
    FetchFileContent,
    FetchDirectoryListing,
    ProcessInfos,
    SendInfo,
    Reanalyze,
    ParseDiff,
    ApplyDiff,
    CheckResult,
    SendResult,
    NextStep,
    FinalCheck,
    FinalDecision,
    SendError,
    ErrorReanalyze,
    End,
}

impl ConversationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::PrepareContext => "PrepareContext",
            Self::SendInitial => "SendInitial",
            Self::AnalyzePlan => "AnalyzePlan",
            Self::Decision => "Decision",
            Self::AnalyzeRequest => "AnalyzeRequest",
            Self::FetchFileContent => "FetchFileContent",
            Self::FetchDirectoryListing => "FetchDirectoryListing",
            Self::ProcessInfos => "ProcessInfos",
            Self::SendInfo => "SendInfo",
            Self::Reanalyze => "Reanalyze",
            Self::ParseDiff => "ParseDiff",
            Self::ApplyDiff => "ApplyDiff",
            Self::CheckResult => "CheckResult",
            Self::SendResult => "SendResult",
            Self::NextStep => "NextStep",
            Self::FinalCheck => "FinalCheck",
            Self::FinalDecision => "FinalDecision",
            Self::SendError => "SendError",
            Self::ErrorReanalyze => "ErrorReanalyze",
            Self::End => "End",
        }
    }

    /// States whose effect is an outbound model call.
    pub fn is_sending(self) -> bool {
        matches!(
            self,
            Self::SendInitial | Self::SendInfo | Self::SendResult | Self::FinalCheck | Self::SendError
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::End
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingPhase {
    InitialAnalysis,
    ContextGathering,
    DetailedAnalysis,
    SolutionPlanning,
    Implementation,
    Verification,
    Finalization,
}

impl ProcessingPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialAnalysis => "INITIAL_ANALYSIS",
            Self::ContextGathering => "CONTEXT_GATHERING",
            Self::DetailedAnalysis => "DETAILED_ANALYSIS",
            Self::SolutionPlanning => "SOLUTION_PLANNING",
            Self::Implementation => "IMPLEMENTATION",
            Self::Verification => "VERIFICATION",
            Self::Finalization => "FINALIZATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileRequestKind {
    FileContent,
    DirectoryListing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HIGH" | "H" | "CRITICAL" => Some(Self::High),
            "MEDIUM" | "M" | "NORMAL" => Some(Self::Medium),
            "LOW" | "L" => Some(Self::Low),
            _ => None,
        }
    }
}

/// One piece of context the model asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRequest {
    #[serde(rename = "type")]
    pub kind: FileRequestKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl FileRequest {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: FileRequestKind::FileContent,
            path: path.into(),
            priority: None,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            kind: FileRequestKind::DirectoryListing,
            path: path.into(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sort key: high, medium, unspecified, low.
    pub fn priority_rank(&self) -> u8 {
        match self.priority {
            Some(Priority::High) => 0,
            Some(Priority::Medium) => 1,
            None => 2,
            Some(Priority::Low) => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub description: String,
}

/// Structured view of one model response. Every field is always populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub thought: Option<String>,
    pub plan: Option<Vec<PlanStep>>,
    pub file_requests: Vec<FileRequest>,
    pub modified_diff: String,
    pub comment_text: String,
    pub completion_signal: bool,
    pub ready_for_final_check: bool,
    pub correction_goals: Option<String>,
    pub verification_report: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parse_warnings: Vec<String>,
}

impl ParsedResponse {
    /// True when nothing actionable could be extracted.
    pub fn is_empty(&self) -> bool {
        self.thought.is_none()
            && self.plan.as_ref().is_none_or(|p| p.is_empty())
            && self.file_requests.is_empty()
            && self.modified_diff.trim().is_empty()
            && self.comment_text.trim().is_empty()
            && !self.completion_signal
            && !self.ready_for_final_check
            && self.verification_report.is_none()
    }

    pub fn has_plan(&self) -> bool {
        self.plan.as_ref().is_some_and(|p| !p.is_empty())
    }

    pub fn has_diff(&self) -> bool {
        !self.modified_diff.trim().is_empty()
    }

    /// Plan rendered back to numbered lines for prompts.
    pub fn plan_text(&self) -> String {
        self.plan
            .as_ref()
            .map(|steps| {
                steps
                    .iter()
                    .map(|s| format!("{}. {}", s.index, s.description))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
    }
}

/// A message in the repair conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System { content: String },
    User { content: String },
    Assistant { content: String },
}

impl ChatMessage {
    pub fn content(&self) -> &str {
        match self {
            Self::System { content } | Self::User { content } | Self::Assistant { content } => {
                content
            }
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl LlmResponse {
    /// The model stopped because it ran out of output tokens.
    pub fn was_truncated(&self) -> bool {
        self.finish_reason == "length"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub fallback_llm: Option<LlmConfig>,
    pub flow: FlowConfig,
    pub retry: RetryConfig,
    pub context: ContextConfig,
    pub diff: DiffConfig,
    pub repository: RepositoryConfig,
    pub paths: PathsConfig,
}

fn default_flow_max_turns() -> u64 {
    15
}
fn default_flow_listing_depth() -> usize {
    2
}
fn default_flow_default_request_limit() -> usize {
    3
}
fn default_retry_quality_attempts() -> u32 {
    3
}
fn default_retry_quality_threshold() -> u32 {
    30
}
fn default_retry_phase_attempts() -> u32 {
    3
}
fn default_context_summary_threshold() -> u64 {
    30_000
}
fn default_context_min_turns() -> u64 {
    3
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".repairflow/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Defaults, then legacy TOML, then user, project and local JSON layers.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));
        Self::load_layers(&Self::legacy_toml_path(workspace), &paths)
    }

    fn load_layers(legacy: &Path, json_layers: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_value: serde_json::Value = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &legacy_value);
        }

        for path in json_layers {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Label used in logs ("primary", "openai", ...).
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 4000,
            temperature: 0.1,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    #[serde(default = "default_flow_max_turns")]
    pub max_turns: u64,
    pub system_prompt: Option<String>,
    #[serde(default = "default_flow_listing_depth")]
    pub directory_listing_depth: usize,
    #[serde(default = "default_flow_default_request_limit")]
    pub default_request_limit: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_turns: default_flow_max_turns(),
            system_prompt: None,
            directory_listing_depth: default_flow_listing_depth(),
            default_request_limit: default_flow_default_request_limit(),
        }
    }
}

/// Which transports the outer retry layer may use for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportSelection {
    #[default]
    PrimaryThenSecondary,
    PrimaryOnly,
    SecondaryOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(default = "default_retry_quality_attempts")]
    pub quality_max_attempts: u32,
    #[serde(default = "default_retry_quality_threshold")]
    pub quality_threshold: u32,
    #[serde(default = "default_retry_phase_attempts")]
    pub phase_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub call_timeout_seconds: u64,
    pub transport: TransportSelection,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            quality_max_attempts: default_retry_quality_attempts(),
            quality_threshold: default_retry_quality_threshold(),
            phase_attempts: default_retry_phase_attempts(),
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.25,
            call_timeout_seconds: 180,
            transport: TransportSelection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    #[serde(default = "default_context_summary_threshold")]
    pub summary_threshold_tokens: u64,
    pub chars_per_token: u64,
    #[serde(default = "default_context_min_turns")]
    pub min_turns_between_summaries: u64,
    pub summary_max_tokens: u32,
    pub summary_temperature: f32,
    /// Per-message character cap when rendering the transcript for summarization.
    pub transcript_message_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            summary_threshold_tokens: default_context_summary_threshold(),
            chars_per_token: 4,
            min_turns_between_summaries: default_context_min_turns(),
            summary_max_tokens: 2048,
            summary_temperature: 0.1,
            transcript_message_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    pub backup_extensions: Vec<String>,
    pub excluded_dirs: Vec<String>,
    pub preview_chars: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            backup_extensions: [
                "go", "proto", "js", "ts", "py", "java", "rs", "json", "yaml", "yml", "toml",
                "md", "txt", "mod", "sum",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            excluded_dirs: [".git", "node_modules", ".vscode", "target", "vendor"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            preview_chars: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub max_file_bytes: u64,
    pub read_timeout_ms: u64,
    pub excluded_dirs: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 1_048_576,
            read_timeout_ms: 30_000,
            excluded_dirs: [".git", "node_modules", ".vscode", "target"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `<template>.txt` prompt files; built-ins are used when unset.
    pub prompt_dir: Option<String>,
    pub log_root: String,
    pub output_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            prompt_dir: None,
            log_root: "logs".to_string(),
            output_root: "output".to_string(),
        }
    }
}
