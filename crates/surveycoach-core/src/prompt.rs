//! Prompt framing for answer evaluation.
//!
//! The model sees one user turn holding the output-format contract plus the
//! question/answer pair, followed by an open model turn. Turn delimiters are
//! configurable because they depend on the model's chat template.

use serde::{Deserialize, Serialize};

const DEFAULT_USER_TURN_START: &str = "<start_of_turn>user\n";
const DEFAULT_TURN_END: &str = "<end_of_turn>\n";
const DEFAULT_MODEL_TURN_START: &str = "<start_of_turn>model\n";
const DEFAULT_OUTPUT_CONTRACT: &str = "You review answers to a field survey. \
Critique the answer below in two or three sentences, then reply with a JSON object \
of the form {\"score\": <0-100>, \"followups\": [\"<question>\", ...]} on its own line.";

/// Default number of follow-up questions extracted from a response.
pub const DEFAULT_MAX_FOLLOWUPS: usize = 3;

/// Strings that wrap a survey answer into a model prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PromptFraming {
    /// Opens the user turn.
    pub user_turn_start: String,

    /// Closes any turn.
    pub turn_end: String,

    /// Opens the model turn the response is generated into.
    pub model_turn_start: String,

    /// Output-format contract placed before the question.
    pub output_contract: String,

    /// Maximum follow-up questions kept from one response.
    pub max_followups: usize,
}

impl Default for PromptFraming {
    fn default() -> Self {
        Self {
            user_turn_start: DEFAULT_USER_TURN_START.to_string(),
            turn_end: DEFAULT_TURN_END.to_string(),
            model_turn_start: DEFAULT_MODEL_TURN_START.to_string(),
            output_contract: DEFAULT_OUTPUT_CONTRACT.to_string(),
            max_followups: DEFAULT_MAX_FOLLOWUPS,
        }
    }
}

impl PromptFraming {
    /// Render the full prompt for one question/answer pair.
    pub fn render(&self, question: &str, answer: &str) -> String {
        let contract = self.output_contract.trim();
        let mut prompt = String::with_capacity(
            self.user_turn_start.len()
                + contract.len()
                + question.len()
                + answer.len()
                + self.turn_end.len()
                + self.model_turn_start.len()
                + 32,
        );

        prompt.push_str(&self.user_turn_start);
        if !contract.is_empty() {
            prompt.push_str(contract);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Question: ");
        prompt.push_str(question.trim());
        prompt.push_str("\nAnswer: ");
        prompt.push_str(answer.trim());
        prompt.push('\n');
        prompt.push_str(&self.turn_end);
        prompt.push_str(&self.model_turn_start);
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_wraps_in_turns() {
        let framing = PromptFraming::default();
        let prompt = framing.render("How much yield did you get?", " 12 bags ");

        assert!(prompt.starts_with(DEFAULT_USER_TURN_START));
        assert!(prompt.ends_with(DEFAULT_MODEL_TURN_START));
        assert!(prompt.contains("Question: How much yield did you get?\n"));
        assert!(prompt.contains("Answer: 12 bags\n"));
        assert!(prompt.contains("\"followups\""));
    }

    #[test]
    fn empty_contract_is_skipped() {
        let framing = PromptFraming {
            user_turn_start: "[U]".into(),
            turn_end: "[/T]".into(),
            model_turn_start: "[M]".into(),
            output_contract: "   ".into(),
            max_followups: 1,
        };
        assert_eq!(framing.render("q", "a"), "[U]Question: q\nAnswer: a\n[/T][M]");
    }

    #[test]
    fn partial_json_uses_defaults() {
        let framing: PromptFraming =
            serde_json::from_str(r#"{"turnEnd": "</s>", "maxFollowups": 5}"#).unwrap();
        assert_eq!(framing.turn_end, "</s>");
        assert_eq!(framing.max_followups, 5);
        assert_eq!(framing.user_turn_start, DEFAULT_USER_TURN_START);
    }
}
