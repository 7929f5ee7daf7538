//! Two retry layers around every model call.
//!
//! The inner layer re-asks when a reply scores below the quality threshold.
//! The outer layer retries transport failures and fails over from the primary
//! to the secondary transport once per run.

mod backoff;
mod quality;
mod transport;

pub use backoff::Backoff;
pub use quality::{QualityMetrics, strengthen_prompt};
pub use transport::{TransportFallback, TransportPhase};

use anyhow::Result;
use repairflow_context::{CompressionOutcome, ContextManager};
use repairflow_core::{ChatMessage, ChatRequest, LlmResponse, ParsedResponse, RetryConfig, TokenUsage};
use repairflow_errors::RepairError;
use repairflow_llm::{LlmClient, call_with_timeout, classify_error};
use repairflow_observe::{Observer, RunEvent};
use repairflow_parser::parse_response;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Output settings for one outgoing request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallSettings {
    pub max_tokens: u32,
    pub temperature: f32,
}

/// The reply the policy settled on.
#[derive(Debug, Clone)]
pub struct PolicyResponse {
    pub response: LlmResponse,
    pub parsed: ParsedResponse,
    pub metrics: QualityMetrics,
    /// Quality attempts made, including the accepted one.
    pub attempts: u32,
    pub transport: TransportPhase,
    /// Usage summed over every successful attempt.
    pub usage: TokenUsage,
}

pub struct RetryPolicy {
    cfg: RetryConfig,
    transport: TransportFallback,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(
        cfg: RetryConfig,
        primary: Arc<dyn LlmClient>,
        secondary: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let transport = TransportFallback::new(primary, secondary, cfg.transport)?;
        let backoff = Backoff::from_config(&cfg);
        Ok(Self {
            cfg,
            transport,
            backoff,
        })
    }

    pub fn phase(&self) -> TransportPhase {
        self.transport.phase()
    }

    pub fn active_client(&self) -> Arc<dyn LlmClient> {
        self.transport.active()
    }

    /// Send the current history and return the best reply.
    ///
    /// The strengthened retry prompt only goes into the outgoing copy; the
    /// history in `context` is never modified here except by compression.
    pub fn send(
        &mut self,
        context: &mut ContextManager,
        settings: CallSettings,
        observer: &Observer,
    ) -> Result<PolicyResponse> {
        let max_attempts = self.cfg.quality_max_attempts.max(1);
        let mut best: Option<PolicyResponse> = None;
        let mut usage = TokenUsage::default();
        let mut last_metrics: Option<QualityMetrics> = None;

        for attempt in 1..=max_attempts {
            let strengthen = last_metrics.map(|m| (m, attempt));
            let (response, phase) = self.call_transport(context, settings, strengthen, observer)?;
            usage.add(response.usage);
            let parsed = parse_response(&response.text);
            let metrics = QualityMetrics::assess(&parsed, response.was_truncated());
            let _ = observer.record_event(&RunEvent::ResponseScored {
                attempt,
                score: metrics.score,
                transport: phase.as_str().to_string(),
            });

            let candidate = PolicyResponse {
                response,
                parsed,
                metrics,
                attempts: attempt,
                transport: phase,
                usage,
            };
            if metrics.passes(self.cfg.quality_threshold) {
                return Ok(candidate);
            }
            observer.verbose_log(&format!(
                "response quality {} below threshold {} (attempt {attempt}/{max_attempts})",
                metrics.score, self.cfg.quality_threshold
            ));
            if best
                .as_ref()
                .is_none_or(|b| candidate.metrics.score > b.metrics.score)
            {
                best = Some(candidate);
            }
            last_metrics = Some(metrics);
            if attempt < max_attempts {
                thread::sleep(self.backoff.delay_for_attempt(attempt - 1));
            }
        }

        match best {
            Some(mut best) => {
                best.attempts = max_attempts;
                best.usage = usage;
                Ok(best)
            }
            None => Err(RepairError::Quality { score: 0 }.into()),
        }
    }

    fn call_transport(
        &mut self,
        context: &mut ContextManager,
        settings: CallSettings,
        strengthen: Option<(QualityMetrics, u32)>,
        observer: &Observer,
    ) -> Result<(LlmResponse, TransportPhase)> {
        let phase_ceiling = self.cfg.phase_attempts.max(1);
        let timeout = Duration::from_secs(self.cfg.call_timeout_seconds.max(1));
        let mut attempts_in_phase = 0_u32;
        let mut total_attempts = 0_u32;
        let mut unclassified_retried = false;

        loop {
            let phase = self.transport.phase();
            let client = self.transport.active();
            let request = build_request(context, settings, strengthen);
            attempts_in_phase += 1;
            total_attempts += 1;

            let err = match call_with_timeout(Arc::clone(&client), &request, timeout) {
                Ok(response) => return Ok((response, phase)),
                Err(err) => err,
            };
            let class = classify_error(&err);
            if class.is_fatal() {
                return Err(RepairError::Fatal(class).into());
            }
            if !class.is_retryable() {
                // Unrecognized failures get one more try inside the phase budget.
                if unclassified_retried || attempts_in_phase >= phase_ceiling {
                    return Err(RepairError::Fatal(class).into());
                }
                unclassified_retried = true;
                observer.warn_log(&format!(
                    "{} transport attempt {attempts_in_phase}/{phase_ceiling} failed, retrying once: {class}",
                    phase.as_str()
                ));
                thread::sleep(self.backoff.delay_for_attempt(attempts_in_phase - 1));
                continue;
            }
            observer.warn_log(&format!(
                "{} transport attempt {attempts_in_phase}/{phase_ceiling} failed: {class}",
                phase.as_str()
            ));

            if class.is_context_length() {
                match context.force_compress(client.as_ref()) {
                    CompressionOutcome::Compressed {
                        before_tokens,
                        after_tokens,
                        ..
                    } => {
                        let _ = observer.record_event(&RunEvent::ContextCompressed {
                            before_tokens,
                            after_tokens,
                            forced: true,
                        });
                    }
                    CompressionOutcome::Failed(reason) => {
                        let _ = observer.record_event(&RunEvent::CompressionFailed { reason });
                    }
                    CompressionOutcome::NotNeeded => {}
                }
            }

            let network_failover = class.is_network() && self.transport.can_switch();
            if network_failover || attempts_in_phase >= phase_ceiling {
                if self.transport.switch_to_secondary() {
                    let _ = observer.record_event(&RunEvent::TransportSwitched {
                        from: phase.as_str().to_string(),
                        to: self.transport.phase().as_str().to_string(),
                        reason: class.to_string(),
                    });
                    observer.warn_log("switching to secondary transport for the rest of the run");
                    attempts_in_phase = 0;
                    continue;
                }
                return Err(RepairError::Transport {
                    phase: phase.as_str().to_string(),
                    attempts: total_attempts,
                    source: class,
                }
                .into());
            }
            thread::sleep(self.backoff.delay_for_attempt(attempts_in_phase - 1));
        }
    }
}

fn build_request(
    context: &ContextManager,
    settings: CallSettings,
    strengthen: Option<(QualityMetrics, u32)>,
) -> ChatRequest {
    let mut messages = context.messages().to_vec();
    if let Some((metrics, attempt)) = strengthen
        && let Some(ChatMessage::User { content }) = messages
            .iter_mut()
            .rev()
            .find(|m| matches!(m, ChatMessage::User { .. }))
    {
        *content = strengthen_prompt(content, &metrics, attempt);
    }
    ChatRequest {
        model: String::new(),
        messages,
        max_tokens: settings.max_tokens,
        temperature: Some(settings.temperature),
    }
}
