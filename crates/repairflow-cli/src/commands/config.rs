use crate::ConfigCmd;
use crate::output::{print_json, redact_config_for_display};
use anyhow::Result;
use repairflow_core::AppConfig;

pub(crate) fn run_config(cfg: &AppConfig, cmd: ConfigCmd, json_mode: bool) -> Result<()> {
    match cmd {
        ConfigCmd::Show => {
            let display_cfg = redact_config_for_display(cfg)?;
            if json_mode {
                print_json(&display_cfg)?;
            } else {
                println!("{}", serde_json::to_string_pretty(&display_cfg)?);
            }
        }
    }
    Ok(())
}
