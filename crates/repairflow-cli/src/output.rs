use anyhow::Result;
use repairflow_core::AppConfig;
use serde::Serialize;
use serde_json::json;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn redact_config_for_display(cfg: &AppConfig) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    for section in ["llm", "fallback_llm"] {
        if let Some(llm) = value.get_mut(section).and_then(|entry| entry.as_object_mut())
            && llm.get("api_key").is_some_and(|key| !key.is_null())
        {
            llm.insert("api_key".to_string(), json!("***REDACTED***"));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use repairflow_core::LlmConfig;

    #[test]
    fn api_keys_are_redacted_in_both_sections() {
        let cfg = AppConfig {
            llm: LlmConfig {
                api_key: Some("sk-primary".to_string()),
                ..LlmConfig::default()
            },
            fallback_llm: Some(LlmConfig {
                api_key: Some("sk-fallback".to_string()),
                ..LlmConfig::default()
            }),
            ..AppConfig::default()
        };
        let shown = redact_config_for_display(&cfg).expect("redact");
        assert_eq!(shown["llm"]["api_key"], "***REDACTED***");
        assert_eq!(shown["fallback_llm"]["api_key"], "***REDACTED***");
        assert!(!shown.to_string().contains("sk-"));
    }

    #[test]
    fn missing_key_stays_null() {
        let shown = redact_config_for_display(&AppConfig::default()).expect("redact");
        assert!(shown["llm"]["api_key"].is_null());
    }
}
