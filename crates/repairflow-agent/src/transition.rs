//! Branching rules of the controller, free of I/O.

use crate::progress::{ProgressState, normalize_path};
use repairflow_core::{ConversationState, FileRequest, FileRequestKind, ParsedResponse};
use repairflow_diff::ApplyReport;

/// Facts about the run that the branch points look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunFacts {
    pub turn: u64,
    pub processed_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Complete,
    AnalyzeRequest,
    ParseDiff,
    /// Nothing was requested yet; ask for a default set of files.
    DefaultRequest,
    End,
}

impl Decision {
    pub fn next_state(self) -> ConversationState {
        match self {
            Self::Complete | Self::End => ConversationState::End,
            Self::AnalyzeRequest | Self::DefaultRequest => ConversationState::AnalyzeRequest,
            Self::ParseDiff => ConversationState::ParseDiff,
        }
    }
}

pub fn decide(facts: RunFacts, parsed: &ParsedResponse) -> Decision {
    if parsed.completion_signal && facts.processed_files > 0 && facts.turn >= 2 {
        Decision::Complete
    } else if !parsed.file_requests.is_empty() {
        Decision::AnalyzeRequest
    } else if parsed.has_diff() {
        Decision::ParseDiff
    } else if facts.processed_files == 0 && facts.turn <= 3 {
        Decision::DefaultRequest
    } else {
        Decision::End
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    /// New requests, high priority first.
    pub fresh: Vec<FileRequest>,
    pub duplicates: Vec<FileRequest>,
    pub next: ConversationState,
}

/// Split requests into fresh and duplicate ones and pick the fetch state.
pub fn route_requests(progress: &ProgressState, requests: &[FileRequest]) -> Routing {
    let mut fresh: Vec<FileRequest> = Vec::new();
    let mut duplicates = Vec::new();
    for request in requests {
        let seen_in_batch = fresh
            .iter()
            .any(|r| r.kind == request.kind && same_path(&r.path, &request.path));
        if seen_in_batch || progress.is_processed(request) {
            duplicates.push(request.clone());
        } else {
            fresh.push(request.clone());
        }
    }
    fresh.sort_by_key(FileRequest::priority_rank);

    let files = fresh.iter().any(|r| r.kind == FileRequestKind::FileContent);
    let dirs = fresh
        .iter()
        .any(|r| r.kind == FileRequestKind::DirectoryListing);
    let next = match (files, dirs) {
        (true, true) => ConversationState::ProcessInfos,
        (true, false) => ConversationState::FetchFileContent,
        (false, true) => ConversationState::FetchDirectoryListing,
        (false, false) => ConversationState::End,
    };
    Routing {
        fresh,
        duplicates,
        next,
    }
}

fn same_path(a: &str, b: &str) -> bool {
    normalize_path(a) == normalize_path(b)
}

pub fn check_result(report: &ApplyReport) -> ConversationState {
    if report.succeeded() && report.validation.is_valid {
        ConversationState::SendResult
    } else {
        ConversationState::SendError
    }
}

/// After the result prompt: a failed parse ends the run.
pub fn next_step(parsed: &ParsedResponse) -> ConversationState {
    if parsed.is_empty() {
        ConversationState::End
    } else if parsed.ready_for_final_check {
        ConversationState::FinalCheck
    } else {
        ConversationState::Decision
    }
}

/// Reanalyze and ErrorReanalyze share this rule.
pub fn reanalyze(parsed: &ParsedResponse) -> ConversationState {
    if parsed.is_empty() {
        ConversationState::End
    } else {
        ConversationState::Decision
    }
}

pub fn final_decision(parsed: &ParsedResponse) -> ConversationState {
    if parsed.completion_signal {
        ConversationState::End
    } else if parsed.has_diff() {
        ConversationState::ParseDiff
    } else {
        ConversationState::End
    }
}

/// Whether the turn cap forbids entering `state`.
pub fn turn_cap_reached(state: ConversationState, turn: u64, max_turns: u64) -> bool {
    state.is_sending() && turn >= max_turns
}
