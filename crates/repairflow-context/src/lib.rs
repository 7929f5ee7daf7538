//! Conversation history with summary-based compression.
//!
//! The history grows by one message per prompt and reply. Once the estimated
//! token count passes the configured threshold, and enough assistant turns
//! have happened since the previous compression, the whole transcript is sent
//! to the model for a JSON summary and replaced by a single resume prompt.

use anyhow::{Result, anyhow};
use repairflow_core::{ChatMessage, ChatRequest, ContextConfig, TokenUsage};
use repairflow_llm::LlmClient;
use repairflow_parser::recovery::{Recovered, recover};
use serde::{Deserialize, Deserializer, Serialize};

const SUMMARIZER_ROLE: &str =
    "You are a specialized assistant for summarizing technical conversations about code modifications.";

const SUMMARIZE_TEMPLATE: &str = "Summarize the following repair conversation so it can be resumed \
without the full history. Keep file paths, error messages and decisions exact.\n\
Respond with JSON only, in this shape:\n\
{\"goal\": \"...\", \"progress\": [\"...\"], \"current_status\": \"...\", \"correction_goals\": \"...\"}\n\n\
=== CONVERSATION ===\n";

const RESUME_TEMPLATE: &str = "The earlier conversation was summarized to save context. Continue the task from here.\n\n\
=== SUMMARY ===\n{summary}\n\n\
=== CORRECTION GOALS ===\n{correction_goals}\n\n\
=== LAST RESULT ===\n{last_result}\n";

/// The model's summary of the conversation so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(default, alias = "original_goal_summary")]
    pub goal: String,
    #[serde(default, alias = "progress_summary", deserialize_with = "string_or_list")]
    pub progress: Vec<String>,
    #[serde(default)]
    pub current_status: String,
    #[serde(default, alias = "open_correction_goals", deserialize_with = "string_or_list")]
    pub correction_goals: Vec<String>,
}

fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// What a compression check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionOutcome {
    NotNeeded,
    Compressed {
        before_tokens: u64,
        after_tokens: u64,
        before_messages: usize,
    },
    /// The summarization call failed; history was left as it was.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompressionRecord {
    pub forced: bool,
    pub before_tokens: u64,
    pub after_tokens: u64,
    pub before_messages: usize,
}

pub struct ContextManager {
    cfg: ContextConfig,
    model: String,
    messages: Vec<ChatMessage>,
    assistant_turns_since_summary: u64,
    summary_usage: TokenUsage,
    correction_goals: Option<String>,
    history: Vec<CompressionRecord>,
}

impl ContextManager {
    pub fn new(cfg: ContextConfig, model: impl Into<String>) -> Self {
        Self {
            cfg,
            model: model.into(),
            messages: Vec::new(),
            assistant_turns_since_summary: 0,
            summary_usage: TokenUsage::default(),
            correction_goals: None,
            history: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn summary_usage(&self) -> TokenUsage {
        self.summary_usage
    }

    pub fn compressions(&self) -> &[CompressionRecord] {
        &self.history
    }

    pub fn set_correction_goals(&mut self, goals: impl Into<String>) {
        self.correction_goals = Some(goals.into());
    }

    pub fn correction_goals(&self) -> Option<&str> {
        self.correction_goals.as_deref()
    }

    /// Append without checking whether compression is due.
    pub fn push(&mut self, message: ChatMessage) {
        if matches!(message, ChatMessage::Assistant { .. }) {
            self.assistant_turns_since_summary += 1;
        }
        self.messages.push(message);
    }

    /// Append, then compress when due.
    pub fn append(&mut self, llm: &dyn LlmClient, message: ChatMessage) -> CompressionOutcome {
        self.push(message);
        if self.should_compress() {
            self.compress(llm, false)
        } else {
            CompressionOutcome::NotNeeded
        }
    }

    /// Characters divided by `chars_per_token`, rounded up.
    pub fn estimated_tokens(&self) -> u64 {
        let chars: u64 = self
            .messages
            .iter()
            .map(|m| m.content().chars().count() as u64)
            .sum();
        chars.div_ceil(self.cfg.chars_per_token.max(1))
    }

    pub fn should_compress(&self) -> bool {
        self.estimated_tokens() > self.cfg.summary_threshold_tokens
            && self.assistant_turns_since_summary >= self.cfg.min_turns_between_summaries
    }

    /// Compress regardless of the turn interval, e.g. after a context-length error.
    pub fn force_compress(&mut self, llm: &dyn LlmClient) -> CompressionOutcome {
        self.compress(llm, true)
    }

    fn compress(&mut self, llm: &dyn LlmClient, forced: bool) -> CompressionOutcome {
        let before_tokens = self.estimated_tokens();
        let before_messages = self.messages.len();
        let summary = match self.summarize(llm) {
            Ok(summary) => summary,
            Err(err) => return CompressionOutcome::Failed(err.to_string()),
        };

        let system = self
            .messages
            .iter()
            .find(|m| matches!(m, ChatMessage::System { .. }))
            .cloned();
        // Keep the reply that triggered the compression.
        let newest_reply = self
            .messages
            .last()
            .filter(|m| matches!(m, ChatMessage::Assistant { .. }))
            .cloned();
        let resume = self.render_resume(&summary);
        self.messages = system.into_iter().collect();
        self.messages.push(ChatMessage::User { content: resume });
        self.messages.extend(newest_reply);
        self.assistant_turns_since_summary = 0;

        let after_tokens = self.estimated_tokens();
        self.history.push(CompressionRecord {
            forced,
            before_tokens,
            after_tokens,
            before_messages,
        });
        CompressionOutcome::Compressed {
            before_tokens,
            after_tokens,
            before_messages,
        }
    }

    fn summarize(&mut self, llm: &dyn LlmClient) -> Result<ConversationSummary> {
        let mut prompt = SUMMARIZE_TEMPLATE.to_string();
        prompt.push_str(&self.transcript());
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::System {
                    content: SUMMARIZER_ROLE.to_string(),
                },
                ChatMessage::User { content: prompt },
            ],
            max_tokens: self.cfg.summary_max_tokens,
            temperature: Some(self.cfg.summary_temperature),
        };
        let response = llm.complete_chat(&request)?;
        self.summary_usage.add(response.usage);
        parse_summary(&response.text)
    }

    fn transcript(&self) -> String {
        self.messages
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                format!(
                    "[Turn {}] {}: {}",
                    idx + 1,
                    m.role().to_ascii_uppercase(),
                    truncate_chars(m.content(), self.cfg.transcript_message_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn render_resume(&self, summary: &ConversationSummary) -> String {
        let summary_json =
            serde_json::to_string_pretty(summary).unwrap_or_else(|_| summary.goal.clone());
        let goals = self
            .correction_goals
            .clone()
            .or_else(|| {
                (!summary.correction_goals.is_empty()).then(|| summary.correction_goals.join("\n"))
            })
            .unwrap_or_else(|| "None recorded.".to_string());
        let last_result = self
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ChatMessage::User { content } => Some(content.as_str()),
                _ => None,
            })
            .unwrap_or("Previous action completed.");
        RESUME_TEMPLATE
            .replace("{summary}", &summary_json)
            .replace("{correction_goals}", &goals)
            .replace("{last_result}", last_result)
    }
}

/// Parse the summarizer's reply, tolerating fences and surrounding prose.
pub fn parse_summary(text: &str) -> Result<ConversationSummary> {
    let outcome = recover(text.trim());
    let Recovered::Value(value) = outcome.recovered else {
        return Err(anyhow!("summary is not a JSON object"));
    };
    if !value.is_object() {
        return Err(anyhow!("summary is not a JSON object"));
    }
    let summary: ConversationSummary = serde_json::from_value(value)?;
    if summary.goal.trim().is_empty() && summary.current_status.trim().is_empty() {
        return Err(anyhow!("summary has neither goal nor status"));
    }
    Ok(summary)
}

/// Cut `text` to at most `max` bytes on a char boundary, appending "...".
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let safe_end = text.floor_char_boundary(max);
        format!("{}...", &text[..safe_end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repairflow_testkit::{Scripted, ScriptedLlm};

    const SUMMARY: &str = r#"{"goal": "propagate new proto field", "progress": ["read main.go"], "current_status": "patch pending", "correction_goals": "keep API"}"#;

    fn small_cfg() -> ContextConfig {
        ContextConfig {
            summary_threshold_tokens: 50,
            chars_per_token: 4,
            min_turns_between_summaries: 2,
            ..ContextConfig::default()
        }
    }

    fn fill(ctx: &mut ContextManager, llm: &ScriptedLlm, turns: usize) -> Vec<CompressionOutcome> {
        let mut outcomes = Vec::new();
        for idx in 0..turns {
            outcomes.push(ctx.append(
                llm,
                ChatMessage::User {
                    content: format!("prompt {idx} {}", "x".repeat(100)),
                },
            ));
            outcomes.push(ctx.append(
                llm,
                ChatMessage::Assistant {
                    content: format!("reply {idx}"),
                },
            ));
        }
        outcomes
    }

    #[test]
    fn token_estimate_rounds_up() {
        let mut ctx = ContextManager::new(ContextConfig::default(), "m");
        ctx.push(ChatMessage::User {
            content: "abcde".to_string(),
        });
        assert_eq!(ctx.estimated_tokens(), 2);
    }

    #[test]
    fn compression_waits_for_turn_interval() {
        let llm = ScriptedLlm::new([SUMMARY]);
        let mut ctx = ContextManager::new(small_cfg(), "m");
        ctx.push(ChatMessage::System {
            content: "system".to_string(),
        });
        let outcomes = fill(&mut ctx, &llm, 2);
        let compressed: Vec<_> = outcomes
            .iter()
            .filter(|o| matches!(o, CompressionOutcome::Compressed { .. }))
            .collect();
        assert_eq!(compressed.len(), 1);
        assert_eq!(llm.call_count(), 1);
        assert!(matches!(outcomes.last(), Some(CompressionOutcome::Compressed { .. })));
        assert_eq!(ctx.messages().len(), 3);
        assert!(matches!(ctx.messages()[0], ChatMessage::System { .. }));
        assert!(ctx.messages()[1].content().contains("propagate new proto field"));
        assert!(ctx.messages()[1].content().contains("prompt 1"));
    }

    #[test]
    fn reply_that_triggers_compression_survives_it() {
        let llm = ScriptedLlm::new([SUMMARY]);
        let mut ctx = ContextManager::new(small_cfg(), "m");
        let outcomes = fill(&mut ctx, &llm, 2);
        assert!(matches!(outcomes.last(), Some(CompressionOutcome::Compressed { .. })));
        assert_eq!(ctx.messages().len(), 2);
        assert!(matches!(ctx.messages()[0], ChatMessage::User { .. }));
        assert_eq!(
            ctx.messages()[1],
            ChatMessage::Assistant {
                content: "reply 1".to_string()
            }
        );
    }

    #[test]
    fn summary_request_uses_low_temperature_and_tracks_usage() {
        let llm = ScriptedLlm::new([SUMMARY]);
        let mut ctx = ContextManager::new(small_cfg(), "m");
        fill(&mut ctx, &llm, 2);
        let req = &llm.requests()[0];
        assert_eq!(req.temperature, Some(0.1));
        assert!(req.messages[1].content().contains("[Turn 1] USER: prompt 0"));
        assert!(ctx.summary_usage().total() > 0);
        assert_eq!(ctx.compressions().len(), 1);
        assert!(!ctx.compressions()[0].forced);
    }

    #[test]
    fn failed_summary_leaves_history_untouched() {
        let llm = ScriptedLlm::new(["this is not json at all"]);
        let mut ctx = ContextManager::new(small_cfg(), "m");
        let outcomes = fill(&mut ctx, &llm, 2);
        assert!(matches!(outcomes.last(), Some(CompressionOutcome::Failed(_))));
        assert_eq!(ctx.messages().len(), 4);
    }

    #[test]
    fn force_compress_ignores_interval() {
        let llm = ScriptedLlm::new([Scripted::from(SUMMARY)]);
        let mut ctx = ContextManager::new(ContextConfig::default(), "m");
        ctx.push(ChatMessage::User {
            content: "only one".to_string(),
        });
        let outcome = ctx.force_compress(&llm);
        assert!(matches!(outcome, CompressionOutcome::Compressed { .. }));
        assert!(ctx.compressions()[0].forced);
    }

    #[test]
    fn controller_goals_win_in_resume_prompt() {
        let llm = ScriptedLlm::new([SUMMARY]);
        let mut ctx = ContextManager::new(ContextConfig::default(), "m");
        ctx.set_correction_goals("Do not rename the RPC.");
        ctx.push(ChatMessage::User {
            content: "x".to_string(),
        });
        ctx.force_compress(&llm);
        let resume = ctx.messages()[0].content();
        assert!(resume.contains("Do not rename the RPC."));
    }

    #[test]
    fn parse_summary_accepts_fenced_and_legacy_keys() {
        let text = "```json\n{\"original_goal_summary\": \"g\", \"progress_summary\": [\"a\"], \"current_status\": \"s\", \"open_correction_goals\": [\"c\"]}\n```";
        let summary = parse_summary(text).expect("summary");
        assert_eq!(summary.goal, "g");
        assert_eq!(summary.progress, vec!["a"]);
        assert_eq!(summary.correction_goals, vec!["c"]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "h...");
        assert_eq!(truncate_chars("abc", 5), "abc");
    }
}
