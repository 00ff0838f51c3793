//! Integration tests for configuration loading as seen by the runtime.

use std::io::Write;

use surveycoach_core::{
    Backend, FollowupExtractor, InferenceConfig, JsonFollowupExtractor, SamplingParams,
    validate_config,
};

const FULL_CONFIG: &str = r#"{
    "modelPath": "/data/models/gemma-3n.task",
    "maxTokens": 768,
    "topK": 0,
    "topP": 1.5,
    "temperature": -1,
    "preferredBackend": "gpu",
    "fallbackBackend": "cpu",
    "framing": {
        "userTurnStart": "<|user|>\n",
        "turnEnd": "<|end|>\n",
        "modelTurnStart": "<|assistant|>\n",
        "outputContract": "Reply with JSON.",
        "maxFollowups": 2
    }
}"#;

#[test]
fn full_config_loads_and_sanitizes() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL_CONFIG.as_bytes()).unwrap();

    let config = InferenceConfig::load(file.path()).unwrap();
    validate_config(&config).unwrap();

    assert_eq!(config.preferred_backend(), Backend::Gpu);
    assert_eq!(config.fallback_backend, Backend::Cpu);

    let params = config.sampling().sanitized();
    assert_eq!(
        params,
        SamplingParams {
            max_tokens: 768,
            top_k: 1,
            top_p: 0.9,
            temperature: 0.7,
        }
    );
}

#[test]
fn framing_feeds_extractor_limit() {
    let config = InferenceConfig::from_json_str(FULL_CONFIG).unwrap();
    let prompt = config.framing.render("Which crop did you plant?", "maize");
    assert!(prompt.starts_with("<|user|>\nReply with JSON.\n\nQuestion: Which crop"));
    assert!(prompt.ends_with("<|assistant|>\n"));

    let response = r#"Clear answer. {"score": 90, "followups": ["Which variety?", "When?", "Why?"]}"#;
    let followups =
        JsonFollowupExtractor::new().extract_followups(response, config.framing.max_followups);
    assert_eq!(followups.len(), 2);
}
