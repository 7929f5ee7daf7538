use anyhow::{Result, anyhow};
use repairflow_core::TransportSelection;
use repairflow_llm::LlmClient;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPhase {
    Primary,
    Secondary,
}

impl TransportPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// Primary and optional secondary transport. Once the secondary takes over it
/// stays active for the rest of the run.
pub struct TransportFallback {
    primary: Arc<dyn LlmClient>,
    secondary: Option<Arc<dyn LlmClient>>,
    selection: TransportSelection,
    phase: TransportPhase,
}

impl TransportFallback {
    pub fn new(
        primary: Arc<dyn LlmClient>,
        secondary: Option<Arc<dyn LlmClient>>,
        selection: TransportSelection,
    ) -> Result<Self> {
        let phase = match selection {
            TransportSelection::SecondaryOnly => {
                if secondary.is_none() {
                    return Err(anyhow!(
                        "retry.transport = secondary-only requires a fallback_llm section"
                    ));
                }
                TransportPhase::Secondary
            }
            TransportSelection::PrimaryOnly | TransportSelection::PrimaryThenSecondary => {
                TransportPhase::Primary
            }
        };
        Ok(Self {
            primary,
            secondary,
            selection,
            phase,
        })
    }

    pub fn phase(&self) -> TransportPhase {
        self.phase
    }

    pub fn active(&self) -> Arc<dyn LlmClient> {
        match (self.phase, &self.secondary) {
            (TransportPhase::Secondary, Some(secondary)) => Arc::clone(secondary),
            _ => Arc::clone(&self.primary),
        }
    }

    pub fn can_switch(&self) -> bool {
        self.phase == TransportPhase::Primary
            && self.secondary.is_some()
            && self.selection == TransportSelection::PrimaryThenSecondary
    }

    /// Move to the secondary transport. Returns false when that is not possible.
    pub fn switch_to_secondary(&mut self) -> bool {
        if !self.can_switch() {
            return false;
        }
        self.phase = TransportPhase::Secondary;
        true
    }
}
