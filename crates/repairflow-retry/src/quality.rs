use repairflow_core::ParsedResponse;
use serde::Serialize;

const PLAN_OR_THOUGHT_POINTS: i32 = 25;
const COMPLETION_POINTS: i32 = 25;
const MODIFIED_POINTS: i32 = 30;
const FILE_REQUEST_POINTS: i32 = 20;
const TRUNCATION_PENALTY: i32 = 50;

/// How useful a parsed reply is, for the per-call quality retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualityMetrics {
    pub has_plan: bool,
    pub has_thought: bool,
    pub has_completion: bool,
    pub has_modified: bool,
    pub has_file_requests: bool,
    pub modified_line_count: usize,
    pub truncated: bool,
    pub score: i32,
}

impl QualityMetrics {
    pub fn assess(parsed: &ParsedResponse, truncated: bool) -> Self {
        let has_plan = parsed.has_plan();
        let has_thought = parsed
            .thought
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        let has_completion = parsed.completion_signal;
        let has_modified = parsed.has_diff();
        let has_file_requests = !parsed.file_requests.is_empty();
        let modified_line_count = parsed.modified_diff.lines().count();

        let mut score = 0;
        if has_plan || has_thought {
            score += PLAN_OR_THOUGHT_POINTS;
        }
        if has_completion {
            score += COMPLETION_POINTS;
        }
        if has_modified {
            score += MODIFIED_POINTS;
        }
        if has_file_requests {
            score += FILE_REQUEST_POINTS;
        }
        if truncated {
            score -= TRUNCATION_PENALTY;
        }
        Self {
            has_plan,
            has_thought,
            has_completion,
            has_modified,
            has_file_requests,
            modified_line_count,
            truncated,
            score,
        }
    }

    pub fn passes(&self, threshold: u32) -> bool {
        i64::from(self.score) >= i64::from(threshold)
    }

    /// Human-readable list of what the reply lacked.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.truncated {
            out.push("the response was cut off by the output token limit; answer more concisely");
        }
        if !self.has_plan && !self.has_thought {
            out.push("no %_Thought_% or %_Plan_% section was found");
        }
        if !self.has_modified && !self.has_file_requests && !self.has_completion {
            out.push(
                "no %_Reply Required_% file requests, no %_Modified_% diff and no %%_Fin_%% marker were found",
            );
        }
        out
    }
}

/// Append retry instructions to the last user prompt of an outgoing request.
pub fn strengthen_prompt(original: &str, metrics: &QualityMetrics, attempt: u32) -> String {
    let mut out = String::with_capacity(original.len() + 512);
    out.push_str(original);
    out.push_str("\n\n=== RETRY INSTRUCTIONS ===\n");
    out.push_str(&format!(
        "This is retry attempt {attempt}. The previous response was incomplete.\n"
    ));
    for issue in metrics.missing() {
        out.push_str(&format!("- ISSUE: {issue}\n"));
    }
    out.push_str(
        "Respond using the tagged sections: %_Thought_%, %_Plan_%, then either \
%_Reply Required_% with the files you need, or %_Modified_% with a unified diff. \
End with %%_Fin_%% only when the repair is complete.\n",
    );
    out
}
