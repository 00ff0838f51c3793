//! `check-config`: show the configuration a session would be built from.

use std::path::Path;

use anyhow::Result;
use serde_json::json;
use surveycoach_core::InferenceConfig;

use super::load_config;

pub fn execute(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("{}", render(&config)?);
    Ok(())
}

/// The loaded config next to the sampling values sessions will actually use.
pub fn render(config: &InferenceConfig) -> Result<String> {
    let sampling = config.sampling();
    let report = json!({
        "config": config,
        "resolvedBackend": config.preferred_backend(),
        "sanitizedSampling": sampling.sanitized(),
        "samplingAdjusted": !sampling.is_sane(),
    });
    Ok(serde_json::to_string_pretty(&report)?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::handlers::load_config;

    #[test]
    fn test_render_reports_sanitized_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"modelPath": "/models/m.bin", "topK": 0, "topP": 3.0}}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        let rendered: serde_json::Value = serde_json::from_str(&render(&config).unwrap()).unwrap();

        assert_eq!(rendered["config"]["topK"], 0);
        assert_eq!(rendered["sanitizedSampling"]["topK"], 1);
        assert_eq!(rendered["samplingAdjusted"], true);
    }

    #[test]
    fn test_missing_model_path_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"maxTokens": 64}}"#).unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
