use repairflow_core::{FileRequest, FileRequestKind, PlanStep, ProcessingPhase};
use repairflow_diff::SystemSnapshot;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Source,
    Config,
    Proto,
    Test,
    Directory,
}

impl FileCategory {
    pub fn of(request: &FileRequest) -> Self {
        if request.kind == FileRequestKind::DirectoryListing {
            return Self::Directory;
        }
        let lower = request.path.to_ascii_lowercase();
        let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        if ext == "proto" {
            Self::Proto
        } else if matches!(ext, "json" | "yaml" | "yml" | "toml") {
            Self::Config
        } else if lower.contains("test") || lower.contains("spec") {
            Self::Test
        } else {
            Self::Source
        }
    }
}

/// What the controller has gathered and done so far in one run.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressState {
    pub phase: ProcessingPhase,
    pub steps_completed: Vec<String>,
    pub steps_remaining: Vec<String>,
    pub source_files: Vec<String>,
    pub config_files: Vec<String>,
    pub proto_files: Vec<String>,
    pub test_files: Vec<String>,
    pub directories: Vec<String>,
    pub analysis_depth: u32,
    pub iteration_count: u32,
    pub error_count: u32,
    pub warning_count: u32,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            phase: ProcessingPhase::InitialAnalysis,
            steps_completed: Vec::new(),
            steps_remaining: Vec::new(),
            source_files: Vec::new(),
            config_files: Vec::new(),
            proto_files: Vec::new(),
            test_files: Vec::new(),
            directories: Vec::new(),
            analysis_depth: 0,
            iteration_count: 0,
            error_count: 0,
            warning_count: 0,
        }
    }
}

impl ProgressState {
    fn bucket(&self, category: FileCategory) -> &Vec<String> {
        match category {
            FileCategory::Source => &self.source_files,
            FileCategory::Config => &self.config_files,
            FileCategory::Proto => &self.proto_files,
            FileCategory::Test => &self.test_files,
            FileCategory::Directory => &self.directories,
        }
    }

    fn bucket_mut(&mut self, category: FileCategory) -> &mut Vec<String> {
        match category {
            FileCategory::Source => &mut self.source_files,
            FileCategory::Config => &mut self.config_files,
            FileCategory::Proto => &mut self.proto_files,
            FileCategory::Test => &mut self.test_files,
            FileCategory::Directory => &mut self.directories,
        }
    }

    pub fn is_processed(&self, request: &FileRequest) -> bool {
        let key = normalize_path(&request.path);
        self.bucket(FileCategory::of(request)).contains(&key)
    }

    /// Returns false when the path was already accumulated.
    pub fn record(&mut self, request: &FileRequest) -> bool {
        let key = normalize_path(&request.path);
        let bucket = self.bucket_mut(FileCategory::of(request));
        if bucket.contains(&key) {
            return false;
        }
        bucket.push(key.clone());
        self.complete_steps_targeting(&key);
        true
    }

    /// Files and directory listings supplied to the model so far.
    pub fn processed_count(&self) -> usize {
        self.source_files.len()
            + self.config_files.len()
            + self.proto_files.len()
            + self.test_files.len()
            + self.directories.len()
    }

    pub fn all_paths(&self) -> Vec<&str> {
        self.proto_files
            .iter()
            .chain(&self.source_files)
            .chain(&self.config_files)
            .chain(&self.test_files)
            .chain(&self.directories)
            .map(String::as_str)
            .collect()
    }

    /// Replace the outstanding steps with a new plan, keeping completed ones.
    pub fn update_plan(&mut self, plan: &[PlanStep]) {
        self.steps_remaining = plan
            .iter()
            .map(|s| s.description.clone())
            .filter(|d| !d.is_empty() && !self.steps_completed.contains(d))
            .collect();
        if self.phase == ProcessingPhase::InitialAnalysis && !self.steps_remaining.is_empty() {
            self.phase = ProcessingPhase::SolutionPlanning;
        }
    }

    fn complete_steps_targeting(&mut self, path: &str) {
        let (done, rest): (Vec<String>, Vec<String>) = self
            .steps_remaining
            .drain(..)
            .partition(|step| step.contains(path));
        self.steps_completed.extend(done);
        self.steps_remaining = rest;
    }

    /// Mark every outstanding step as done after a successful apply.
    pub fn complete_remaining_steps(&mut self) {
        let rest: Vec<String> = self.steps_remaining.drain(..).collect();
        self.steps_completed.extend(rest);
    }

    pub fn note_reanalysis(&mut self) {
        self.analysis_depth += 1;
        if self.analysis_depth >= 2 && self.phase == ProcessingPhase::ContextGathering {
            self.phase = ProcessingPhase::DetailedAnalysis;
        }
    }

    pub fn snapshot(&self, turn: u64) -> SystemSnapshot {
        SystemSnapshot {
            phase: self.phase,
            turn,
            error_count: self.error_count,
        }
    }

    /// Multi-line state block for prompts.
    pub fn describe(&self, turn: u64) -> String {
        let list = |items: &[String]| {
            if items.is_empty() {
                "(none)".to_string()
            } else {
                items.join(", ")
            }
        };
        format!(
            "{}\nIteration: {}, Analysis depth: {}, Warnings: {}\n\
Proto files: {}\nSource files: {}\nConfig files: {}\nTest files: {}\nDirectories: {}\n\
Steps completed: {}\nSteps remaining: {}",
            self.snapshot(turn).describe(),
            self.iteration_count,
            self.analysis_depth,
            self.warning_count,
            list(&self.proto_files),
            list(&self.source_files),
            list(&self.config_files),
            list(&self.test_files),
            list(&self.directories),
            self.steps_completed.len(),
            self.steps_remaining.len(),
        )
    }
}

/// Key used to compare request paths: `./` and trailing `/` dropped, the root as `.`.
pub(crate) fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_extension_and_name() {
        assert_eq!(FileCategory::of(&FileRequest::file("api/v1/svc.proto")), FileCategory::Proto);
        assert_eq!(FileCategory::of(&FileRequest::file("deploy/app.yaml")), FileCategory::Config);
        assert_eq!(FileCategory::of(&FileRequest::file("server/server_test.go")), FileCategory::Test);
        assert_eq!(FileCategory::of(&FileRequest::file("server/server.go")), FileCategory::Source);
        assert_eq!(FileCategory::of(&FileRequest::directory("server")), FileCategory::Directory);
    }

    #[test]
    fn a_path_is_recorded_once() {
        let mut progress = ProgressState::default();
        assert!(progress.record(&FileRequest::file("./main.go")));
        assert!(progress.is_processed(&FileRequest::file("main.go")));
        assert!(!progress.record(&FileRequest::file("main.go")));
        assert!(!progress.is_processed(&FileRequest::directory("main.go")));
        assert_eq!(progress.processed_count(), 1);
    }

    #[test]
    fn fetching_a_target_completes_its_step() {
        let mut progress = ProgressState::default();
        progress.update_plan(&[
            PlanStep {
                index: 1,
                action: Some("REVIEW_FILE_CONTENT".to_string()),
                target: Some("main.go".to_string()),
                description: "Review main.go".to_string(),
            },
            PlanStep {
                index: 2,
                action: None,
                target: None,
                description: "Fix the handler".to_string(),
            },
        ]);
        assert_eq!(progress.phase, ProcessingPhase::SolutionPlanning);
        progress.record(&FileRequest::file("main.go"));
        assert_eq!(progress.steps_completed, vec!["Review main.go".to_string()]);
        assert_eq!(progress.steps_remaining, vec!["Fix the handler".to_string()]);
    }
}
