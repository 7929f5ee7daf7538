//! Error taxonomy for a repair run and user-facing rendering of failures.

use anyhow::Error;
use repairflow_llm::LlmError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

/// Failures the flow controller routes on.
#[derive(Debug, Clone, ThisError)]
pub enum RepairError {
    /// The model reply could not be turned into anything usable.
    #[error("could not parse model response: {0}")]
    Parse(String),
    /// Restored content failed validation (conflict markers, bad encoding).
    #[error("diff validation failed: {0}")]
    DiffValidation(String),
    /// The patch engine rejected the diff.
    #[error("diff application failed: {message}")]
    DiffApplication { message: String, context: String },
    /// Every transport attempt in every available phase failed.
    #[error("transport failed after {attempts} attempt(s) in {phase} phase: {source}")]
    Transport {
        phase: String,
        attempts: u32,
        #[source]
        source: LlmError,
    },
    #[error("response quality below threshold (score {score})")]
    Quality { score: i32 },
    /// Not worth retrying: authentication, permissions, malformed request.
    #[error("fatal: {0}")]
    Fatal(#[source] LlmError),
    /// A signal stopped the run between steps.
    #[error("interrupted by signal")]
    Interrupted,
}

impl RepairError {
    /// The run cannot continue after this error.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            Self::Fatal(_) | Self::Transport { .. } | Self::Interrupted
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::DiffValidation(_) => "diff_validation",
            Self::DiffApplication { .. } => "diff_application",
            Self::Transport { .. } => "transport",
            Self::Quality { .. } => "quality",
            Self::Fatal(_) => "fatal",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Find a [`RepairError`] anywhere in an error chain.
pub fn repair_error(err: &Error) -> Option<&RepairError> {
    err.chain().find_map(|e| e.downcast_ref::<RepairError>())
}

/// Enhanced error with user-friendly message and recovery suggestions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorType {
    Configuration,
    Network,
    Permission,
    /// Malformed model output or diff trouble.
    Runtime,
    Validation,
    Unknown,
}

impl EnhancedError {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions
            .extend(suggestions.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    pub fn format(&self, verbose: bool) -> String {
        let mut output = format!("[{}] {}\n  {}\n", self.error_type.label(), self.title, self.message);
        if verbose && let Some(context) = &self.context {
            output.push_str(&format!("\n  Context: {context}\n"));
        }
        if !self.suggestions.is_empty() {
            output.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }
        output
    }
}

impl ErrorType {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorType::Configuration => "config",
            ErrorType::Network => "network",
            ErrorType::Permission => "permission",
            ErrorType::Runtime => "runtime",
            ErrorType::Validation => "validation",
            ErrorType::Unknown => "error",
        }
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

/// Renders any error for the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorHandler {
    verbose: bool,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handle(&self, error: &Error) -> String {
        self.enhance(error).format(self.verbose)
    }

    pub fn enhance(&self, error: &Error) -> EnhancedError {
        if let Some(enhanced) = error.downcast_ref::<EnhancedError>() {
            return enhanced.clone();
        }
        if let Some(repair) = repair_error(error) {
            return from_repair_error(repair);
        }
        if let Some(llm) = error.chain().find_map(|e| e.downcast_ref::<LlmError>()) {
            return from_llm_error(llm);
        }
        classify_error(&format!("{error:#}"))
    }
}

fn from_repair_error(err: &RepairError) -> EnhancedError {
    match err {
        RepairError::Transport { source, .. } | RepairError::Fatal(source) => {
            from_llm_error(source).with_context(err.to_string())
        }
        RepairError::Parse(_) => EnhancedError::new("Unparseable Response", err.to_string(), ErrorType::Runtime)
            .with_suggestions([
                "Check that the prompt templates still ask for %_Tag_% sections",
                "Inspect the interaction log for the raw reply",
            ]),
        RepairError::DiffValidation(_) | RepairError::DiffApplication { .. } => {
            let mut enhanced =
                EnhancedError::new("Patch Failed", err.to_string(), ErrorType::Validation)
                    .with_suggestion("Compare the diff against the files in the premerge snapshot");
            if let RepairError::DiffApplication { context, .. } = err {
                enhanced = enhanced.with_context(context.clone());
            }
            enhanced
        }
        RepairError::Quality { .. } => {
            EnhancedError::new("Low Quality Response", err.to_string(), ErrorType::Runtime)
                .with_suggestion("Try a stronger model or lower retry.quality_threshold")
        }
        RepairError::Interrupted => {
            EnhancedError::new("Interrupted", "The run was stopped by a signal.", ErrorType::Unknown)
        }
    }
}

fn from_llm_error(err: &LlmError) -> EnhancedError {
    match err {
        LlmError::Authentication { env } => {
            EnhancedError::new("Missing API Key", err.to_string(), ErrorType::Configuration)
                .with_suggestions([
                    format!("Set the {env} environment variable"),
                    "Add llm.api_key to .repairflow/settings.json".to_string(),
                ])
        }
        LlmError::PermissionDenied(_) | LlmError::InsufficientBalance(_) => {
            EnhancedError::new("Access Denied", err.to_string(), ErrorType::Permission)
                .with_suggestion("Check the account behind the configured API key")
        }
        LlmError::BadRequest(_) | LlmError::NotFound(_) => {
            EnhancedError::new("Request Rejected", err.to_string(), ErrorType::Configuration)
                .with_suggestions(["Check llm.model and llm.endpoint", "Run `repairflow config show`"])
        }
        LlmError::Network(_) | LlmError::Timeout(_) | LlmError::RateLimited(_) | LlmError::Server { .. } => {
            EnhancedError::new("Network Error", err.to_string(), ErrorType::Network)
                .with_suggestions([
                    "Check your internet connection",
                    "Configure fallback_llm to fail over to another provider",
                ])
        }
        _ => EnhancedError::new("Model Error", err.to_string(), ErrorType::Runtime),
    }
}

/// Classify a plain message by substring.
pub fn classify_error(error_message: &str) -> EnhancedError {
    let lower = error_message.to_lowercase();
    if lower.contains("api key") || lower.contains("configuration") || lower.contains("settings") {
        return EnhancedError::new("Configuration Error", error_message, ErrorType::Configuration)
            .with_suggestions([
                "Check .repairflow/settings.json",
                "Set the environment variable named by llm.api_key_env",
            ]);
    }
    if lower.contains("network") || lower.contains("timeout") || lower.contains("connection") {
        return EnhancedError::new("Network Error", error_message, ErrorType::Network)
            .with_suggestions(["Check your internet connection", "Try again in a few moments"]);
    }
    if lower.contains("permission") || lower.contains("denied") {
        return EnhancedError::new("Permission Error", error_message, ErrorType::Permission)
            .with_suggestion("Check file permissions on the project and output directories");
    }
    if lower.contains("no such file") || lower.contains("not found") {
        return EnhancedError::new("Not Found", error_message, ErrorType::Validation)
            .with_suggestion("Check --task-dir and --project-dir");
    }
    EnhancedError::new("Error", error_message, ErrorType::Unknown)
        .with_suggestion("Re-run with --verbose and inspect the interaction log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn transport_and_fatal_end_the_run() {
        let transport = RepairError::Transport {
            phase: "secondary".to_string(),
            attempts: 3,
            source: LlmError::Network("reset".to_string()),
        };
        assert!(transport.ends_run());
        assert!(RepairError::Fatal(LlmError::BadRequest("x".to_string())).ends_run());
        assert!(!RepairError::Parse("x".to_string()).ends_run());
        assert!(
            !RepairError::DiffApplication {
                message: "m".to_string(),
                context: "c".to_string()
            }
            .ends_run()
        );
    }

    #[test]
    fn repair_error_is_found_through_context() {
        let err = anyhow::Error::new(RepairError::Quality { score: 10 }).context("turn 3");
        assert_eq!(repair_error(&err).map(RepairError::kind), Some("quality"));
    }

    #[test]
    fn auth_failure_suggests_env_var() {
        let err = anyhow::Error::new(RepairError::Fatal(LlmError::Authentication {
            env: "OPENAI_API_KEY".to_string(),
        }));
        let rendered = ErrorHandler::new().handle(&err);
        assert!(rendered.contains("Missing API Key"));
        assert!(rendered.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn diff_context_only_shown_when_verbose() {
        let err = anyhow::Error::new(RepairError::DiffApplication {
            message: "ENOENT".to_string(),
            context: "Affected files: a.go".to_string(),
        });
        assert!(!ErrorHandler::new().handle(&err).contains("Affected files"));
        assert!(ErrorHandler::new().verbose(true).handle(&err).contains("Affected files"));
    }

    #[test]
    fn plain_errors_are_classified_by_message() {
        let enhanced = ErrorHandler::new().enhance(&anyhow!("connection refused"));
        assert_eq!(enhanced.error_type, ErrorType::Network);
        let enhanced = ErrorHandler::new().enhance(&anyhow!("weird"));
        assert_eq!(enhanced.error_type, ErrorType::Unknown);
    }
}
