//! The repair flow: a state machine that talks to the model, gathers
//! project context, applies diffs and logs every turn.

mod controller;
mod progress;
mod repository;
mod templates;
mod transition;

pub use controller::{
    FlowBuilder, FlowController, RepairTask, RunSummary, TASK_INPUTS, verification_summary,
};
pub use progress::{FileCategory, ProgressState};
pub use repository::{FileRepository, WorkspaceFileRepository};
pub use templates::{
    DirectoryTemplates, TemplateRenderer, TemplateVars, render_placeholders, response_format,
};
pub use transition::{
    Decision, RunFacts, Routing, check_result, decide, final_decision, next_step, reanalyze,
    route_requests, turn_cap_reached,
};

/// Template names understood by [`DirectoryTemplates`].
pub mod template_names {
    pub use crate::templates::{ERROR, FINAL_CHECK, INITIAL, REPLY, RESULT};
}
