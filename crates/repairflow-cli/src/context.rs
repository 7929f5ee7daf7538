use anyhow::Result;
use repairflow_core::AppConfig;
use repairflow_llm::{LlmClient, OpenAiCompatibleClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Command-line values that win over every settings layer.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConfigOverrides {
    pub model: Option<String>,
    pub max_turns: Option<u64>,
    pub prompt_dir: Option<PathBuf>,
}

pub(crate) fn load_config(cwd: &Path, overrides: &ConfigOverrides) -> Result<AppConfig> {
    let mut cfg = AppConfig::load(cwd)?;
    apply_overrides(&mut cfg, overrides);
    Ok(cfg)
}

fn apply_overrides(cfg: &mut AppConfig, overrides: &ConfigOverrides) {
    if let Some(model) = overrides.model.as_ref().filter(|m| !m.trim().is_empty()) {
        cfg.llm.model = model.clone();
    }
    if let Some(max_turns) = overrides.max_turns {
        cfg.flow.max_turns = max_turns;
    }
    if let Some(dir) = &overrides.prompt_dir {
        cfg.paths.prompt_dir = Some(dir.to_string_lossy().into_owned());
    }
}

/// Primary and optional fallback HTTP clients from the `llm` and
/// `fallback_llm` sections.
pub(crate) fn build_clients(
    cfg: &AppConfig,
) -> Result<(Arc<dyn LlmClient>, Option<Arc<dyn LlmClient>>)> {
    let primary: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleClient::new(cfg.llm.clone())?);
    let secondary = match &cfg.fallback_llm {
        Some(fallback) => {
            let client: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleClient::new(fallback.clone())?);
            Some(client)
        }
        None => None,
    };
    Ok((primary, secondary))
}

/// Flag set by SIGINT/SIGTERM. The controller checks it between steps.
pub(crate) fn install_interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))?;
    }
    Ok(flag)
}

/// Resolve `path` against `cwd` unless it is already absolute.
pub(crate) fn under(cwd: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
