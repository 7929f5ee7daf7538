use crate::progress::ProgressState;
use crate::repository::{FileRepository, WorkspaceFileRepository};
use crate::templates::{self, DirectoryTemplates, TemplateRenderer, TemplateVars};
use crate::transition::{self, Decision, RunFacts};
use anyhow::{Result, anyhow};
use chrono::Utc;
use repairflow_context::{CompressionOutcome, ContextManager};
use repairflow_core::{
    AppConfig, ChatMessage, ConversationState, FileRequest, FileRequestKind, ParsedResponse,
    ProcessingPhase, TokenUsage,
};
use repairflow_diff::{
    ApplyReport, DiffApplier, ErrorContext, FailureKind, PatchEngine, RestorePatchEngine,
    affected_files,
};
use repairflow_errors::{RepairError, repair_error};
use repairflow_llm::LlmClient;
use repairflow_observe::{
    JsonRunLogger, LlmRequestRecord, LlmResponseRecord, Observer, RunEvent, RunLog, RunMetadata,
    RunStatus, TokenTotals, TurnRecord, resolve_final_status,
};
use repairflow_parser::strip_fences;
use repairflow_retry::{CallSettings, RetryPolicy};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Task inputs read by PrepareContext, in template-variable order.
pub const TASK_INPUTS: &[(&str, &str)] = &[
    ("protoFile", "01_proto.txt"),
    ("protoFileChanges", "02_protoFileChanges.txt"),
    ("fileChanges", "03_fileChanges.txt"),
    ("surroundedFilePath", "04_surroundedFilePath.txt"),
    ("suspectedFiles", "05_suspectedFiles.txt"),
];

const DEFAULT_VERIFICATION: &str = "Previous verification report indicated all goals were achieved.";
const RESTORED_PREVIEW_CHARS: usize = 2000;

/// Where one task lives and how it is labelled in the run log.
#[derive(Debug, Clone)]
pub struct RepairTask {
    pub project: String,
    pub category: String,
    pub task: String,
    /// Directory with the `0N_*.txt` inputs; `None` renders every input as unavailable.
    pub input_dir: Option<PathBuf>,
    /// Snapshot of the project the model repairs.
    pub project_dir: PathBuf,
    /// Backups, restored artifacts and the observe log go here.
    pub output_dir: PathBuf,
    pub log_root: PathBuf,
}

/// What a finished run reports to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub turns: u64,
    pub final_state: ConversationState,
    pub tokens: TokenTotals,
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Assembles a [`FlowController`]. Every collaborator except the primary
/// model client has a default built from the config.
pub struct FlowBuilder {
    cfg: AppConfig,
    task: RepairTask,
    primary: Option<Arc<dyn LlmClient>>,
    secondary: Option<Arc<dyn LlmClient>>,
    repository: Option<Box<dyn FileRepository>>,
    templates: Option<Box<dyn TemplateRenderer>>,
    patch_engine: Option<Arc<dyn PatchEngine>>,
    run_log: Option<Box<dyn RunLog>>,
    interrupt: Option<Arc<AtomicBool>>,
    verbose: bool,
}

impl FlowBuilder {
    pub fn primary(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.primary = Some(client);
        self
    }

    pub fn secondary(mut self, client: Option<Arc<dyn LlmClient>>) -> Self {
        self.secondary = client;
        self
    }

    pub fn repository(mut self, repository: Box<dyn FileRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn templates(mut self, templates: Box<dyn TemplateRenderer>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn patch_engine(mut self, engine: Arc<dyn PatchEngine>) -> Self {
        self.patch_engine = Some(engine);
        self
    }

    pub fn run_log(mut self, run_log: Box<dyn RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn build(self) -> Result<FlowController> {
        let Self {
            cfg,
            task,
            primary,
            secondary,
            repository,
            templates,
            patch_engine,
            run_log,
            interrupt,
            verbose,
        } = self;
        let primary = primary.ok_or_else(|| anyhow!("no model client configured"))?;
        fs::create_dir_all(&task.output_dir)?;

        let mut observer = Observer::new(&task.output_dir).unwrap_or_else(|_| Observer::silent());
        observer.set_verbose(verbose);

        let repository = repository.unwrap_or_else(|| {
            Box::new(WorkspaceFileRepository::new(
                &task.project_dir,
                cfg.repository.clone(),
            ))
        });
        let templates = templates.unwrap_or_else(|| {
            Box::new(DirectoryTemplates::new(
                cfg.paths.prompt_dir.as_ref().map(PathBuf::from),
            ))
        });
        let patch_engine = patch_engine
            .unwrap_or_else(|| Arc::new(RestorePatchEngine::new(&task.project_dir)));
        let run_log = run_log.unwrap_or_else(|| {
            Box::new(JsonRunLogger::new(
                &task.log_root,
                &task.project,
                &task.category,
                &task.task,
            ))
        });

        let policy = RetryPolicy::new(cfg.retry.clone(), primary, secondary)?;
        let context = ContextManager::new(cfg.context.clone(), cfg.llm.model.clone());
        let applier = DiffApplier::new(
            &task.project_dir,
            &task.output_dir,
            cfg.diff.clone(),
            patch_engine,
        );

        Ok(FlowController {
            cfg,
            task,
            state: ConversationState::Start,
            turn: 0,
            progress: ProgressState::default(),
            context,
            policy,
            applier,
            repository,
            templates,
            run_log,
            observer,
            interrupt: interrupt.unwrap_or_default(),
            pending_prompt: None,
            last_raw: String::new(),
            last_parsed: None,
            pending_requests: Vec::new(),
            fetched_context: String::new(),
            current_diff: String::new(),
            applied_diff: None,
            last_report: None,
            last_failure: None,
            correction_goals: None,
            completion_seen: false,
            interrupted: false,
            error: None,
            usage: TokenUsage::default(),
            started_at: Utc::now().to_rfc3339(),
            finalized: false,
        })
    }
}

struct Failure {
    message: String,
    context: Option<ErrorContext>,
}

/// Drives one repair task from Start to End.
pub struct FlowController {
    cfg: AppConfig,
    task: RepairTask,
    state: ConversationState,
    turn: u64,
    progress: ProgressState,
    context: ContextManager,
    policy: RetryPolicy,
    applier: DiffApplier,
    repository: Box<dyn FileRepository>,
    templates: Box<dyn TemplateRenderer>,
    run_log: Box<dyn RunLog>,
    observer: Observer,
    interrupt: Arc<AtomicBool>,

    pending_prompt: Option<String>,
    last_raw: String,
    last_parsed: Option<ParsedResponse>,
    pending_requests: Vec<FileRequest>,
    fetched_context: String,
    current_diff: String,
    applied_diff: Option<String>,
    last_report: Option<ApplyReport>,
    last_failure: Option<Failure>,
    correction_goals: Option<String>,
    completion_seen: bool,
    interrupted: bool,
    error: Option<String>,
    usage: TokenUsage,
    started_at: String,
    finalized: bool,
}

impl FlowController {
    pub fn builder(cfg: AppConfig, task: RepairTask) -> FlowBuilder {
        FlowBuilder {
            cfg,
            task,
            primary: None,
            secondary: None,
            repository: None,
            templates: None,
            patch_engine: None,
            run_log: None,
            interrupt: None,
            verbose: false,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn progress(&self) -> &ProgressState {
        &self.progress
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn correction_goals(&self) -> Option<&str> {
        self.correction_goals.as_deref()
    }

    pub fn backups_root(&self) -> PathBuf {
        self.applier.backups_root()
    }

    /// Run to End and write the run log. A controller runs once.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.finalized {
            return Err(anyhow!("run for task {} already finished", self.task.task));
        }
        self.observer.verbose_log(&format!(
            "starting task {}/{}/{}",
            self.task.project, self.task.category, self.task.task
        ));
        while !self.state.is_terminal() {
            if self.interrupt.load(Ordering::SeqCst) {
                self.observer.warn_log("interrupted; finishing the run");
                self.interrupted = true;
                self.transition_to(ConversationState::End);
                break;
            }
            if transition::turn_cap_reached(self.state, self.turn, self.cfg.flow.max_turns) {
                self.observer.verbose_log(&format!(
                    "turn cap of {} reached before {}",
                    self.cfg.flow.max_turns, self.state
                ));
                self.transition_to(ConversationState::End);
                break;
            }
            self.advance();
        }
        Ok(self.finalize())
    }

    /// Run the current state's step and move to the state it returns.
    /// Failures are routed here rather than propagated.
    pub fn advance(&mut self) {
        let current = self.state;
        let next = match self.step(current) {
            Ok(next) => next,
            Err(err) => self.route_failure(current, err),
        };
        self.transition_to(next);
    }

    fn transition_to(&mut self, next: ConversationState) {
        self.state = next;
        let _ = self.observer.record_event(&RunEvent::StateEntered {
            turn: self.turn,
            state: next,
        });
    }

    fn step(&mut self, state: ConversationState) -> Result<ConversationState> {
        use ConversationState as S;
        match state {
            S::Start => Ok(S::PrepareContext),
            S::PrepareContext => self.step_prepare_context(),
            S::SendInitial => self.step_send_initial(),
            S::AnalyzePlan => self.step_analyze_plan(),
            S::Decision => self.step_decision(),
            S::AnalyzeRequest => Ok(self.step_analyze_request()),
            S::FetchFileContent | S::FetchDirectoryListing | S::ProcessInfos => {
                self.step_fetch(state)
            }
            S::SendInfo => self.step_send_info(),
            S::Reanalyze => Ok(self.step_reanalyze()),
            S::ParseDiff => Ok(self.step_parse_diff()),
            S::ApplyDiff => Ok(self.step_apply_diff()),
            S::CheckResult => Ok(self.step_check_result()),
            S::SendResult => self.step_send_result(),
            S::NextStep => Ok(self.step_next_step()),
            S::FinalCheck => self.step_final_check(),
            S::FinalDecision => Ok(self.step_final_decision()),
            S::SendError => self.step_send_error(),
            S::ErrorReanalyze => Ok(self.step_error_reanalyze()),
            S::End => Ok(S::End),
        }
    }

    fn route_failure(&mut self, current: ConversationState, err: anyhow::Error) -> ConversationState {
        let message = format!("{err:#}");
        self.progress.error_count += 1;
        let aborts = repair_error(&err)
            .is_some_and(|e| e.ends_run() || matches!(e, RepairError::Parse(_)));
        if aborts || matches!(current, ConversationState::SendError | ConversationState::ErrorReanalyze)
        {
            self.observer
                .warn_log(&format!("{current} failed, ending the run: {message}"));
            self.error = Some(message);
            return ConversationState::End;
        }
        self.observer
            .verbose_log(&format!("{current} failed, reporting to the model: {message}"));
        self.last_failure = Some(Failure {
            message,
            context: None,
        });
        ConversationState::SendError
    }

    fn step_prepare_context(&mut self) -> Result<ConversationState> {
        let mut vars = TemplateVars::new();
        for (var, file) in TASK_INPUTS {
            vars.insert(var.to_string(), read_task_input(self.task.input_dir.as_deref(), file));
        }
        vars.insert(
            "responseFormat".to_string(),
            templates::response_format().to_string(),
        );
        let prompt = self.templates.render(templates::INITIAL, &vars)?;
        if let Some(system) = self.cfg.flow.system_prompt.as_ref()
            && !system.trim().is_empty()
        {
            self.context.push(ChatMessage::System {
                content: system.clone(),
            });
        }
        self.pending_prompt = Some(prompt);
        Ok(ConversationState::SendInitial)
    }

    fn step_send_initial(&mut self) -> Result<ConversationState> {
        let prompt = self
            .pending_prompt
            .take()
            .ok_or_else(|| anyhow!("initial prompt was not prepared"))?;
        self.exchange(ConversationState::SendInitial, templates::INITIAL, prompt)?;
        Ok(ConversationState::AnalyzePlan)
    }

    fn step_analyze_plan(&mut self) -> Result<ConversationState> {
        let raw = self.last_raw.trim();
        if raw.is_empty() {
            return Err(RepairError::Parse("the first reply was empty".to_string()).into());
        }
        let mut parsed = self.last_parsed.clone().unwrap_or_default();
        if parsed.is_empty() {
            // Unmarked prose still counts as the model's opening analysis.
            parsed.thought = Some(raw.to_string());
            self.last_parsed = Some(parsed.clone());
        }
        self.absorb(&parsed);
        Ok(ConversationState::Decision)
    }

    fn step_decision(&mut self) -> Result<ConversationState> {
        self.progress.iteration_count += 1;
        let Some(parsed) = self.last_parsed.clone() else {
            return Ok(ConversationState::End);
        };
        let facts = RunFacts {
            turn: self.turn,
            processed_files: self.progress.processed_count(),
        };
        let decision = transition::decide(facts, &parsed);
        self.observer
            .verbose_log(&format!("decision at turn {}: {decision:?}", self.turn));
        match decision {
            Decision::Complete => self.completion_seen = true,
            Decision::AnalyzeRequest => self.pending_requests = parsed.file_requests.clone(),
            Decision::DefaultRequest => {
                self.pending_requests = self
                    .repository
                    .default_requests(self.cfg.flow.default_request_limit);
            }
            Decision::ParseDiff | Decision::End => {}
        }
        Ok(decision.next_state())
    }

    fn step_analyze_request(&mut self) -> ConversationState {
        let requests = std::mem::take(&mut self.pending_requests);
        let routing = transition::route_requests(&self.progress, &requests);
        if !routing.duplicates.is_empty() {
            self.progress.warning_count += 1;
            let paths: Vec<&str> = routing.duplicates.iter().map(|r| r.path.as_str()).collect();
            self.observer
                .verbose_log(&format!("skipping already retrieved: {}", paths.join(", ")));
        }
        self.pending_requests = routing.fresh;
        routing.next
    }

    fn step_fetch(&mut self, state: ConversationState) -> Result<ConversationState> {
        let requests = std::mem::take(&mut self.pending_requests);
        let want_files = state != ConversationState::FetchDirectoryListing;
        let want_dirs = state != ConversationState::FetchFileContent;
        let mut sections = Vec::new();

        let files: Vec<FileRequest> = requests
            .iter()
            .filter(|r| r.kind == FileRequestKind::FileContent)
            .cloned()
            .collect();
        if want_files && !files.is_empty() {
            sections.push(self.repository.get_file_contents(&files)?);
            for request in &files {
                self.progress.record(request);
            }
        }
        if want_dirs {
            for request in requests
                .iter()
                .filter(|r| r.kind == FileRequestKind::DirectoryListing)
            {
                sections.push(
                    self.repository
                        .get_directory_listing(&request.path, self.cfg.flow.directory_listing_depth)?,
                );
                self.progress.record(request);
            }
        }

        self.fetched_context = sections.join("\n\n");
        self.progress.phase = ProcessingPhase::ContextGathering;
        Ok(ConversationState::SendInfo)
    }

    fn step_send_info(&mut self) -> Result<ConversationState> {
        let previous = self.last_parsed.clone().unwrap_or_default();
        let mut vars = self.base_vars();
        vars.insert(
            "filesRequested".to_string(),
            std::mem::take(&mut self.fetched_context),
        );
        vars.insert(
            "previousThought".to_string(),
            previous.thought.clone().unwrap_or_default(),
        );
        vars.insert("previousPlan".to_string(), previous.plan_text());
        vars.insert(
            "retrievedSoFar".to_string(),
            self.progress.all_paths().join(", "),
        );
        let prompt = self.templates.render(templates::REPLY, &vars)?;
        self.exchange(ConversationState::SendInfo, templates::REPLY, prompt)?;
        Ok(ConversationState::Reanalyze)
    }

    fn step_reanalyze(&mut self) -> ConversationState {
        self.progress.note_reanalysis();
        let parsed = self.last_parsed.clone().unwrap_or_default();
        self.absorb(&parsed);
        transition::reanalyze(&parsed)
    }

    fn step_parse_diff(&mut self) -> ConversationState {
        let raw = self
            .last_parsed
            .as_ref()
            .map(|p| p.modified_diff.as_str())
            .unwrap_or_default();
        let diff = strip_fences(raw);
        if diff.trim().is_empty() {
            self.observer.verbose_log("no diff to apply");
            return ConversationState::End;
        }
        self.current_diff = diff;
        ConversationState::ApplyDiff
    }

    fn step_apply_diff(&mut self) -> ConversationState {
        self.progress.phase = ProcessingPhase::Implementation;
        let snapshot = self.progress.snapshot(self.turn);
        let report = self.applier.apply(&self.current_diff, &snapshot);
        self.last_report = Some(report);
        ConversationState::CheckResult
    }

    fn step_check_result(&mut self) -> ConversationState {
        let Some(report) = self.last_report.as_ref() else {
            return ConversationState::End;
        };
        let next = transition::check_result(report);
        if next == ConversationState::SendError {
            let message = apply_error(report).to_string();
            let context = report.failure.as_ref().map(|f| f.context.clone());
            let _ = self.observer.record_event(&RunEvent::DiffFailed {
                turn: self.turn,
                message: message.clone(),
            });
            self.progress.error_count += 1;
            self.last_failure = Some(Failure { message, context });
        } else {
            let _ = self.observer.record_event(&RunEvent::DiffApplied {
                turn: self.turn,
                files: report.stats.modified_files,
                added: report.stats.added_lines,
                deleted: report.stats.deleted_lines,
            });
            self.progress.warning_count += report.validation.warnings.len() as u32;
            self.progress.complete_remaining_steps();
            self.applied_diff = Some(self.current_diff.clone());
        }
        next
    }

    fn step_send_result(&mut self) -> Result<ConversationState> {
        self.progress.phase = ProcessingPhase::Verification;
        let report = self
            .last_report
            .as_ref()
            .ok_or_else(|| anyhow!("no apply report to send"))?;
        let mut vars = self.base_vars();
        vars.insert(
            "applyStats".to_string(),
            format_stats(report, &self.current_diff),
        );
        vars.insert(
            "warnings".to_string(),
            if report.validation.warnings.is_empty() {
                "(none)".to_string()
            } else {
                report.validation.warnings.join("\n")
            },
        );
        vars.insert(
            "restoredPreview".to_string(),
            report.restored_preview(RESTORED_PREVIEW_CHARS),
        );
        let prompt = self.templates.render(templates::RESULT, &vars)?;
        self.exchange(ConversationState::SendResult, templates::RESULT, prompt)?;
        Ok(ConversationState::NextStep)
    }

    fn step_next_step(&mut self) -> ConversationState {
        let parsed = self.last_parsed.clone().unwrap_or_default();
        self.absorb(&parsed);
        transition::next_step(&parsed)
    }

    fn step_final_check(&mut self) -> Result<ConversationState> {
        self.progress.phase = ProcessingPhase::Finalization;
        let previous = self.last_parsed.clone().unwrap_or_default();
        let mut vars = self.base_vars();
        vars.insert(
            "verificationSummary".to_string(),
            verification_summary(&previous),
        );
        vars.insert(
            "modifiedFiles".to_string(),
            self.applied_diff
                .clone()
                .unwrap_or_else(|| "No files modified".to_string()),
        );
        let prompt = self.templates.render(templates::FINAL_CHECK, &vars)?;
        self.exchange(ConversationState::FinalCheck, templates::FINAL_CHECK, prompt)?;
        Ok(ConversationState::FinalDecision)
    }

    fn step_final_decision(&mut self) -> ConversationState {
        let parsed = self.last_parsed.clone().unwrap_or_default();
        self.absorb(&parsed);
        if parsed.completion_signal {
            self.completion_seen = true;
        }
        transition::final_decision(&parsed)
    }

    fn step_send_error(&mut self) -> Result<ConversationState> {
        let failure = self.last_failure.take().unwrap_or(Failure {
            message: "the previous step failed without a message".to_string(),
            context: None,
        });
        let mut vars = self.base_vars();
        vars.insert("errorMessage".to_string(), failure.message);
        vars.insert(
            "errorContext".to_string(),
            failure
                .context
                .map(|c| c.to_string())
                .unwrap_or_else(|| "(none)".to_string()),
        );
        let prompt = self.templates.render(templates::ERROR, &vars)?;
        self.exchange(ConversationState::SendError, templates::ERROR, prompt)?;
        Ok(ConversationState::ErrorReanalyze)
    }

    fn step_error_reanalyze(&mut self) -> ConversationState {
        let parsed = self.last_parsed.clone().unwrap_or_default();
        self.absorb(&parsed);
        transition::reanalyze(&parsed)
    }

    /// Variables every follow-up template receives.
    fn base_vars(&self) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.insert(
            "correctionGoals".to_string(),
            self.correction_goals
                .clone()
                .unwrap_or_else(|| "(not stated)".to_string()),
        );
        vars.insert("systemState".to_string(), self.progress.describe(self.turn));
        vars.insert(
            "responseFormat".to_string(),
            templates::response_format().to_string(),
        );
        vars
    }

    /// Take in what a parsed response tells us about goals and plan.
    fn absorb(&mut self, parsed: &ParsedResponse) {
        if self.correction_goals.is_none()
            && let Some(goals) = parsed.correction_goals.as_ref()
            && !goals.trim().is_empty()
        {
            self.correction_goals = Some(goals.clone());
            self.context.set_correction_goals(goals.clone());
        }
        if let Some(plan) = parsed.plan.as_ref()
            && !plan.is_empty()
        {
            self.progress.update_plan(plan);
        }
    }

    /// Send `prompt` as the next user message and record the turn.
    fn exchange(&mut self, state: ConversationState, template: &str, prompt: String) -> Result<()> {
        let client = self.policy.active_client();
        let outcome = self.context.append(
            client.as_ref(),
            ChatMessage::User {
                content: prompt.clone(),
            },
        );
        self.note_compression(outcome);

        let settings = CallSettings {
            max_tokens: self.cfg.llm.max_tokens,
            temperature: self.cfg.llm.temperature,
        };
        let reply = self.policy.send(&mut self.context, settings, &self.observer)?;
        self.turn += 1;
        self.usage.add(reply.usage);

        let client = self.policy.active_client();
        let outcome = self.context.append(
            client.as_ref(),
            ChatMessage::Assistant {
                content: reply.response.text.clone(),
            },
        );
        self.note_compression(outcome);

        let record = TurnRecord {
            turn: self.turn,
            timestamp: Utc::now().to_rfc3339(),
            state,
            phase: self.progress.phase,
            llm_request: LlmRequestRecord {
                template: template.to_string(),
                prompt,
                message_count: self.context.messages().len(),
            },
            llm_response: LlmResponseRecord {
                raw_content: reply.response.text.clone(),
                parsed_content: reply.parsed.clone(),
                usage: reply.usage,
                finish_reason: reply.response.finish_reason.clone(),
                transport: reply.transport.as_str().to_string(),
                quality_score: reply.metrics.score,
                attempts: reply.attempts,
            },
            system_action: Some(format!("sent {template}")),
        };
        self.run_log.append_turn(record)?;
        self.last_raw = reply.response.text;
        self.last_parsed = Some(reply.parsed);
        Ok(())
    }

    fn note_compression(&self, outcome: CompressionOutcome) {
        let event = match outcome {
            CompressionOutcome::NotNeeded => return,
            CompressionOutcome::Compressed {
                before_tokens,
                after_tokens,
                ..
            } => RunEvent::ContextCompressed {
                before_tokens,
                after_tokens,
                forced: false,
            },
            CompressionOutcome::Failed(reason) => {
                self.observer
                    .warn_log(&format!("context compression failed: {reason}"));
                RunEvent::CompressionFailed { reason }
            }
        };
        let _ = self.observer.record_event(&event);
    }

    /// Resolve the status and write the run log. Runs once per controller.
    fn finalize(&mut self) -> RunSummary {
        self.finalized = true;
        let status = resolve_final_status(
            self.completion_seen,
            self.error.is_some(),
            self.run_log.turns(),
        );
        let tokens = TokenTotals::new(self.usage, self.context.summary_usage());
        let transport = self.policy.phase().as_str().to_string();
        let error = self
            .error
            .clone()
            .or_else(|| self.interrupted.then(|| RepairError::Interrupted.to_string()));

        let metadata = RunMetadata {
            experiment_id: Uuid::now_v7().to_string(),
            project: self.task.project.clone(),
            category: self.task.category.clone(),
            task: self.task.task.clone(),
            start_time: self.started_at.clone(),
            end_time: Utc::now().to_rfc3339(),
            status,
            total_turns: self.turn,
            total_tokens: tokens,
            provider: self.cfg.llm.provider.clone(),
            model: self.cfg.llm.model.clone(),
            final_transport: transport.clone(),
            final_state: self.state,
            error: error.clone(),
        };
        let log_path = match self.run_log.finalize(metadata) {
            Ok(path) => Some(path),
            Err(err) => {
                self.observer
                    .warn_log(&format!("failed to write the run log: {err:#}"));
                None
            }
        };
        let _ = self.observer.record_event(&RunEvent::RunFinished {
            status,
            turns: self.turn,
        });
        self.observer.verbose_log(&format!(
            "task {} finished: {status:?} after {} turn(s)",
            self.task.task, self.turn
        ));

        RunSummary {
            status,
            turns: self.turn,
            final_state: self.state,
            tokens,
            transport,
            log_path,
            error,
        }
    }
}

fn read_task_input(dir: Option<&Path>, file: &str) -> String {
    let Some(dir) = dir else {
        return format!("({file} not available)");
    };
    match fs::read_to_string(dir.join(file)) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => format!("({file} not available)"),
    }
}

/// The routing error a failed apply report stands for.
fn apply_error(report: &ApplyReport) -> RepairError {
    match &report.failure {
        Some(failure) if failure.kind != FailureKind::Validation => RepairError::DiffApplication {
            message: failure.message.clone(),
            context: failure.context.to_string(),
        },
        Some(failure) => RepairError::DiffValidation(failure.message.clone()),
        None => RepairError::DiffValidation(report.validation.errors.join("; ")),
    }
}

fn format_stats(report: &ApplyReport, diff: &str) -> String {
    let stats = &report.stats;
    let files = affected_files(diff);
    format!(
        "Files: {}, Hunks: {}, Lines: +{} -{}, Backup: {}, Time: {} ms\nAffected: {}",
        stats.modified_files,
        stats.hunks,
        stats.added_lines,
        stats.deleted_lines,
        if stats.backup_created { "yes" } else { "no" },
        stats.processing_time_ms,
        if files.is_empty() {
            "(none)".to_string()
        } else {
            files.join(", ")
        }
    )
}

/// Text after the first line that mentions verification, from the
/// verification report first and the thought second.
pub fn verification_summary(parsed: &ParsedResponse) -> String {
    [parsed.verification_report.as_deref(), parsed.thought.as_deref()]
        .into_iter()
        .flatten()
        .find_map(from_verification_line)
        .unwrap_or_else(|| DEFAULT_VERIFICATION.to_string())
}

fn from_verification_line(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.to_ascii_lowercase().contains("verification"))?;
    let summary = lines[start..].join("\n").trim().to_string();
    (!summary.is_empty()).then_some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use repairflow_diff::{ApplyFailure, DiffStats, DiffValidationResult};

    #[test]
    fn verification_summary_starts_at_the_matching_line() {
        let parsed = ParsedResponse {
            thought: Some("Looked at the handler.\nVerification: the status code is now 404.\nAll good.".to_string()),
            ..ParsedResponse::default()
        };
        assert_eq!(
            verification_summary(&parsed),
            "Verification: the status code is now 404.\nAll good."
        );
        let report_first = ParsedResponse {
            thought: Some("verification in thought".to_string()),
            verification_report: Some("Verification report: goals met".to_string()),
            ..ParsedResponse::default()
        };
        assert_eq!(verification_summary(&report_first), "Verification report: goals met");
    }

    #[test]
    fn verification_summary_defaults() {
        let parsed = ParsedResponse {
            thought: Some("nothing relevant".to_string()),
            ..ParsedResponse::default()
        };
        assert_eq!(verification_summary(&parsed), DEFAULT_VERIFICATION);
    }

    #[test]
    fn failed_reports_map_to_diff_errors() {
        let mut report = ApplyReport {
            stats: DiffStats::default(),
            validation: DiffValidationResult {
                errors: vec!["conflict markers in a.go".to_string()],
                ..DiffValidationResult::default()
            },
            backup: None,
            restored: String::new(),
            artifact: None,
            failure: None,
        };
        let err = apply_error(&report);
        assert_eq!(err.kind(), "diff_validation");
        assert_eq!(err.to_string(), "diff validation failed: conflict markers in a.go");

        report.failure = Some(ApplyFailure {
            kind: FailureKind::Engine,
            message: "ENOENT".to_string(),
            context: ErrorContext {
                diff_preview: String::new(),
                affected_files: vec!["a.go".to_string()],
                system_state: String::new(),
                possible_causes: Vec::new(),
            },
        });
        let err = apply_error(&report);
        assert_eq!(err.kind(), "diff_application");
        assert_eq!(err.to_string(), "diff application failed: ENOENT");
        assert!(!err.ends_run());
        let RepairError::DiffApplication { context, .. } = err else {
            panic!("expected an application error");
        };
        assert!(context.contains("Affected files: a.go"));
    }

    #[test]
    fn missing_inputs_render_as_unavailable() {
        assert_eq!(read_task_input(None, "01_proto.txt"), "(01_proto.txt not available)");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("01_proto.txt"), "syntax = \"proto3\";").expect("write");
        assert_eq!(
            read_task_input(Some(dir.path()), "01_proto.txt"),
            "syntax = \"proto3\";"
        );
        assert_eq!(
            read_task_input(Some(dir.path()), "02_protoFileChanges.txt"),
            "(02_protoFileChanges.txt not available)"
        );
    }
}
