//! Prompt templates with `{{var}}` placeholders.

use anyhow::{Result, anyhow};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

pub const INITIAL: &str = "00_prompt";
pub const REPLY: &str = "00_promptReply";
pub const RESULT: &str = "00_promptModified";
pub const ERROR: &str = "00_promptError";
pub const FINAL_CHECK: &str = "00_promptFinalCheck";

pub type TemplateVars = BTreeMap<String, String>;

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, vars: &TemplateVars) -> Result<String>;
}

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").ok());

/// Substitute `{{name}}` placeholders. Names missing from `vars` render empty.
pub fn render_placeholders(template: &str, vars: &TemplateVars) -> String {
    let Some(re) = LazyLock::force(&PLACEHOLDER).as_ref() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures<'_>| {
        vars.get(&caps[1]).cloned().unwrap_or_default()
    })
    .into_owned()
}

/// Reads `<name>.txt` from the prompt directory and falls back to the
/// built-in text for the five standard templates.
pub struct DirectoryTemplates {
    dir: Option<PathBuf>,
}

impl DirectoryTemplates {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn builtin_only() -> Self {
        Self { dir: None }
    }

    fn source(&self, name: &str) -> Result<String> {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{name}.txt"));
            if path.is_file() {
                return fs::read_to_string(&path)
                    .map_err(|err| anyhow!("failed to read template {}: {err}", path.display()));
            }
        }
        builtin(name)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("unknown prompt template: {name}"))
    }
}

impl TemplateRenderer for DirectoryTemplates {
    fn render(&self, name: &str, vars: &TemplateVars) -> Result<String> {
        Ok(render_placeholders(&self.source(name)?, vars))
    }
}

fn builtin(name: &str) -> Option<&'static str> {
    Some(match name {
        INITIAL => BUILTIN_INITIAL,
        REPLY => BUILTIN_REPLY,
        RESULT => BUILTIN_RESULT,
        ERROR => BUILTIN_ERROR,
        FINAL_CHECK => BUILTIN_FINAL_CHECK,
        _ => return None,
    })
}

const RESPONSE_FORMAT: &str = "Answer with tagged sections, each tag on its own line:\n\
%_Thought_%      your reasoning\n\
%_Plan_%         numbered steps or a JSON array of steps\n\
%_Correction_Goals_%  what must hold once the repair is done (first answer only)\n\
%_Reply Required_%    JSON array of files you need, e.g. [{\"type\": \"FILE_CONTENT\", \"path\": \"server/api.go\"}] or [{\"type\": \"DIRECTORY_LISTING\", \"path\": \"server\"}]\n\
%_Modified_%     a unified diff against the project root\n\
%_Comment_%      anything else worth noting\n\
%_Verification_Report_%  how you checked the applied diff against the goals\n\
%_Ready_For_Final_Check_%  when the diff is applied and you want a final review\n\
%%_Fin_%%        only when the repair is complete";

const BUILTIN_INITIAL: &str = "Fix or improve program code related to gRPC. It may contain potential bugs. \
Refer to the proto to make code corrections.\n\n\
=== PROTO FILE ===\n{{protoFile}}\n\n\
=== PROTO FILE CHANGES ===\n{{protoFileChanges}}\n\n\
=== FILE CHANGES ===\n{{fileChanges}}\n\n\
=== SURROUNDING FILE PATHS ===\n{{surroundedFilePath}}\n\n\
=== SUSPECTED FILES ===\n{{suspectedFiles}}\n\n\
{{responseFormat}}\n";

const BUILTIN_REPLY: &str = "Here is the context you requested.\n\n\
=== REQUESTED CONTEXT ===\n{{filesRequested}}\n\n\
=== PREVIOUS THOUGHT ===\n{{previousThought}}\n\n\
=== PREVIOUS PLAN ===\n{{previousPlan}}\n\n\
=== CORRECTION GOALS ===\n{{correctionGoals}}\n\n\
=== ALREADY RETRIEVED ===\n{{retrievedSoFar}}\n\n\
=== SYSTEM STATE ===\n{{systemState}}\n\n\
Continue the analysis. Request more files, or propose a diff.\n\n{{responseFormat}}\n";

const BUILTIN_RESULT: &str = "Your diff was applied.\n\n\
=== APPLY STATS ===\n{{applyStats}}\n\n\
=== WARNINGS ===\n{{warnings}}\n\n\
=== RESTORED CONTENT PREVIEW ===\n{{restoredPreview}}\n\n\
=== CORRECTION GOALS ===\n{{correctionGoals}}\n\n\
=== SYSTEM STATE ===\n{{systemState}}\n\n\
Check the result against the correction goals. Send another diff if more work is needed, \
mark %_Ready_For_Final_Check_% when you want a final review, or finish with %%_Fin_%%.\n\n{{responseFormat}}\n";

const BUILTIN_ERROR: &str = "The last step failed.\n\n\
=== ERROR ===\n{{errorMessage}}\n\n\
=== ERROR CONTEXT ===\n{{errorContext}}\n\n\
=== CORRECTION GOALS ===\n{{correctionGoals}}\n\n\
=== SYSTEM STATE ===\n{{systemState}}\n\n\
Work out what went wrong and try again: request the files you need or send a corrected diff.\n\n{{responseFormat}}\n";

const BUILTIN_FINAL_CHECK: &str = "Final check before the repair is closed.\n\n\
=== VERIFICATION SUMMARY ===\n{{verificationSummary}}\n\n\
=== MODIFIED FILES ===\n{{modifiedFiles}}\n\n\
=== SYSTEM STATE ===\n{{systemState}}\n\n\
If every correction goal is met, answer with %%_Fin_%%. Otherwise send a further %_Modified_% diff.\n\n{{responseFormat}}\n";

/// Format instructions shared by every built-in template.
pub fn response_format() -> &'static str {
    RESPONSE_FORMAT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_substitute_and_missing_render_empty() {
        let out = render_placeholders(
            "a={{ a }} b={{b}} c={{c}} {not a var}",
            &vars(&[("a", "1"), ("b", "{{a}}")]),
        );
        assert_eq!(out, "a=1 b={{a}} c= {not a var}");
    }

    #[test]
    fn prompt_dir_overrides_builtin() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("00_promptReply.txt"), "custom {{filesRequested}}").expect("write");
        let templates = DirectoryTemplates::new(Some(dir.path().to_path_buf()));
        let out = templates
            .render(REPLY, &vars(&[("filesRequested", "--- a.go")]))
            .expect("render");
        assert_eq!(out, "custom --- a.go");

        let initial = templates
            .render(INITIAL, &vars(&[("protoFile", "syntax = \"proto3\";")]))
            .expect("builtin");
        assert!(initial.contains("=== PROTO FILE ===\nsyntax = \"proto3\";"));
    }

    #[test]
    fn unknown_template_is_an_error() {
        assert!(
            DirectoryTemplates::builtin_only()
                .render("nope", &TemplateVars::new())
                .is_err()
        );
    }
}
