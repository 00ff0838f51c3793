//! Input fed into a session before generation starts.

/// PCM audio attached to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    /// PCM f32 samples, mono.
    pub samples: Vec<f32>,

    /// Sample rate of the audio (e.g., 16 000 Hz).
    pub sample_rate: u32,
}

/// Text and/or audio fed into a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelInput {
    /// Prompt text.
    pub text: String,

    /// Optional audio payload for multimodal engines.
    pub audio: Option<AudioPayload>,
}

impl ModelInput {
    /// Text-only input.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: None,
        }
    }

    /// Attach an audio payload.
    #[must_use]
    pub fn with_audio(mut self, audio: AudioPayload) -> Self {
        self.audio = Some(audio);
        self
    }

    /// True when there is neither text nor audio to generate from.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.audio.as_ref().is_none_or(|a| a.samples.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_is_empty() {
        assert!(ModelInput::text("  \n").is_empty());
        assert!(!ModelInput::text("yield?").is_empty());
    }

    #[test]
    fn audio_only_is_not_empty() {
        let input = ModelInput::default().with_audio(AudioPayload {
            samples: vec![0.0; 160],
            sample_rate: 16_000,
        });
        assert!(!input.is_empty());

        let silent = ModelInput::default().with_audio(AudioPayload {
            samples: vec![],
            sample_rate: 16_000,
        });
        assert!(silent.is_empty());
    }
}
