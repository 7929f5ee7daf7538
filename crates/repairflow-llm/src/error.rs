use thiserror::Error;

/// Classified transport failure. The retry layer decides what to do from the
/// variant alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("Rate limited (HTTP 429): {0}")]
    RateLimited(String),
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    #[error("Server error (HTTP {status}): {detail}")]
    Server { status: u16, detail: String },
    #[error("Malformed response payload: {0}")]
    MalformedPayload(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),
    #[error("Invalid or missing API key (HTTP 401). Set {env} or configure llm.api_key.")]
    Authentication { env: String },
    #[error("Bad request (HTTP 400): {0}")]
    BadRequest(String),
    #[error("Endpoint or model not found (HTTP 404): {0}")]
    NotFound(String),
    #[error("Permission denied (HTTP 403): {0}")]
    PermissionDenied(String),
    #[error("Insufficient balance (HTTP 402): {0}")]
    InsufficientBalance(String),
    #[error("{0}")]
    Other(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_)
                | Self::Timeout(_)
                | Self::Server { .. }
                | Self::MalformedPayload(_)
                | Self::Network(_)
                | Self::ContextLengthExceeded(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::BadRequest(_)
                | Self::NotFound(_)
                | Self::PermissionDenied(_)
                | Self::InsufficientBalance(_)
        )
    }

    /// Connection-level trouble that a different provider might not share.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_context_length(&self) -> bool {
        matches!(self, Self::ContextLengthExceeded(_))
    }

    /// Map an HTTP status and body to a variant.
    pub fn from_status(status: u16, body: &str, api_key_env: &str) -> Self {
        let detail = error_detail(body);
        match status {
            400 if mentions_context_length(&detail) => Self::ContextLengthExceeded(detail),
            400 => Self::BadRequest(detail),
            401 => Self::Authentication {
                env: api_key_env.to_string(),
            },
            402 => Self::InsufficientBalance(detail),
            403 => Self::PermissionDenied(detail),
            404 => Self::NotFound(detail),
            408 => Self::Timeout(0),
            413 => Self::ContextLengthExceeded(detail),
            429 => Self::RateLimited(detail),
            500..=599 => Self::Server { status, detail },
            _ => Self::Other(format!("HTTP {status}: {detail}")),
        }
    }
}

/// Recover the classification from an error chain, falling back to message
/// inspection for errors raised outside this crate.
pub fn classify_error(err: &anyhow::Error) -> LlmError {
    if let Some(classified) = err.chain().find_map(|e| e.downcast_ref::<LlmError>()) {
        return classified.clone();
    }
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if mentions_context_length(&lower) {
        LlmError::ContextLengthExceeded(message)
    } else if lower.contains("429") || lower.contains("rate limit") {
        LlmError::RateLimited(message)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmError::Timeout(0)
    } else if lower.contains("401") || lower.contains("unauthorized") || lower.contains("api key")
    {
        LlmError::Authentication {
            env: String::new(),
        }
    } else if lower.contains("connection")
        || lower.contains("dns")
        || lower.contains("network")
        || lower.contains("econnreset")
    {
        LlmError::Network(message)
    } else if lower.contains("json") || lower.contains("payload") {
        LlmError::MalformedPayload(message)
    } else {
        LlmError::Other(message)
    }
}

fn mentions_context_length(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("context length")
        || lower.contains("context_length")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn status_classification_matches_retry_rules() {
        assert!(LlmError::from_status(429, "{}", "K").is_retryable());
        assert!(LlmError::from_status(503, "{}", "K").is_retryable());
        assert!(LlmError::from_status(401, "{}", "K").is_fatal());
        assert!(LlmError::from_status(402, "{}", "K").is_fatal());
        assert!(LlmError::from_status(403, "{}", "K").is_fatal());
        assert!(LlmError::from_status(404, "{}", "K").is_fatal());
        assert!(LlmError::from_status(400, r#"{"error":{"message":"bad field"}}"#, "K").is_fatal());
    }

    #[test]
    fn context_length_400_is_retryable_not_fatal() {
        let err = LlmError::from_status(
            400,
            r#"{"error":{"message":"This model's maximum context length is 8192 tokens"}}"#,
            "K",
        );
        assert!(err.is_context_length());
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn classify_prefers_typed_error_in_chain() {
        let err = anyhow::Error::new(LlmError::Network("reset".to_string())).context("calling model");
        assert_eq!(classify_error(&err), LlmError::Network("reset".to_string()));
    }

    #[test]
    fn classify_falls_back_to_message() {
        assert!(matches!(
            classify_error(&anyhow!("upstream said: rate limit reached")),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            classify_error(&anyhow!("expected value at line 1 column 1 (json)")),
            LlmError::MalformedPayload(_)
        ));
        assert!(matches!(
            classify_error(&anyhow!("something odd")),
            LlmError::Other(_)
        ));
    }

    #[test]
    fn auth_error_names_the_env_var() {
        let err = LlmError::from_status(401, "", "OPENAI_API_KEY");
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
