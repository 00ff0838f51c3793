//! Sampling parameters carried by a session.
//!
//! A session is cheap to rebuild, so these values are re-read from the
//! handle's configuration every time one is created. Values coming from the
//! configuration file are untrusted and go through [`SamplingParams::sanitized`]
//! before reaching an engine.

use serde::{Deserialize, Serialize};

/// Default maximum number of tokens generated per response.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Default top-K limit.
pub const DEFAULT_TOP_K: i32 = 40;

/// Default nucleus sampling threshold, used when the configured value is out of range.
pub const DEFAULT_TOP_P: f32 = 0.9;

/// Default temperature, used when the configured value is out of range.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Upper bound for temperature.
pub const MAX_TEMPERATURE: f32 = 2.0;

/// Sampling parameters for one session.
///
/// # Examples
///
/// ```rust
/// use surveycoach_core::SamplingParams;
///
/// let params = SamplingParams {
///     max_tokens: 512,
///     top_k: 0,
///     top_p: 1.5,
///     temperature: -1.0,
/// }
/// .sanitized();
///
/// assert_eq!(params.top_k, 1);
/// assert!((params.top_p - 0.9).abs() < f32::EPSILON);
/// assert!((params.temperature - 0.7).abs() < f32::EPSILON);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingParams {
    /// Hard limit on response length. Does not include input tokens.
    pub max_tokens: u32,

    /// Considers only the K most likely next tokens (>= 1).
    pub top_k: i32,

    /// Nucleus sampling threshold (0.0 - 1.0).
    pub top_p: f32,

    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl SamplingParams {
    /// Return a copy that every engine accepts.
    ///
    /// - `top_k` below 1 becomes 1
    /// - `top_p` outside `[0, 1]` (or NaN) falls back to [`DEFAULT_TOP_P`]
    /// - `temperature` outside `[0, 2]` (or NaN) falls back to [`DEFAULT_TEMPERATURE`]
    /// - `max_tokens` of 0 falls back to [`DEFAULT_MAX_TOKENS`]
    #[must_use]
    pub fn sanitized(self) -> Self {
        let top_k = self.top_k.max(1);

        let top_p = if (0.0..=1.0).contains(&self.top_p) {
            self.top_p
        } else {
            DEFAULT_TOP_P
        };

        let temperature = if (0.0..=MAX_TEMPERATURE).contains(&self.temperature) {
            self.temperature
        } else {
            DEFAULT_TEMPERATURE
        };

        let max_tokens = if self.max_tokens == 0 {
            DEFAULT_MAX_TOKENS
        } else {
            self.max_tokens
        };

        Self {
            max_tokens,
            top_k,
            top_p,
            temperature,
        }
    }

    /// Whether sanitizing would change any field.
    #[must_use]
    pub fn is_sane(&self) -> bool {
        self.sanitized() == *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        assert!(SamplingParams::default().is_sane());
    }

    #[test]
    fn test_top_k_zero_becomes_one() {
        let params = SamplingParams {
            top_k: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(params.top_k, 1);

        let negative = SamplingParams {
            top_k: -7,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(negative.top_k, 1);
    }

    #[test]
    fn test_out_of_range_top_p_uses_default() {
        let params = SamplingParams {
            top_p: 1.5,
            ..Default::default()
        }
        .sanitized();
        assert!((params.top_p - DEFAULT_TOP_P).abs() < f32::EPSILON);

        let nan = SamplingParams {
            top_p: f32::NAN,
            ..Default::default()
        }
        .sanitized();
        assert!((nan.top_p - DEFAULT_TOP_P).abs() < f32::EPSILON);
    }

    #[test]
    fn test_boundary_values_are_kept() {
        let params = SamplingParams {
            max_tokens: 1,
            top_k: 1,
            top_p: 1.0,
            temperature: 2.0,
        };
        assert!(params.is_sane());

        let zeros = SamplingParams {
            max_tokens: 1,
            top_k: 1,
            top_p: 0.0,
            temperature: 0.0,
        };
        assert!(zeros.is_sane());
    }

    #[test]
    fn test_negative_temperature_uses_default() {
        let params = SamplingParams {
            temperature: -1.0,
            ..Default::default()
        }
        .sanitized();
        assert!((params.temperature - DEFAULT_TEMPERATURE).abs() < f32::EPSILON);
    }

    #[test]
    fn test_zero_max_tokens_uses_default() {
        let params = SamplingParams {
            max_tokens: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(params.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_serialization() {
        let params = SamplingParams {
            max_tokens: 256,
            top_k: 20,
            top_p: 0.8,
            temperature: 0.3,
        };

        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("maxTokens"));
        let deserialized: SamplingParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, deserialized);
    }
}
