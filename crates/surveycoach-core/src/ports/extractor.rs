//! Follow-up/score extractor port.
//!
//! A pure, stateless function over the final response text, called once
//! per terminal event.

/// Extracts a score and follow-up questions from a model response.
pub trait FollowupExtractor: Send + Sync {
    /// Score contained in the response, if any.
    fn extract_score(&self, final_text: &str) -> Option<i32>;

    /// Up to `max` follow-up questions contained in the response.
    fn extract_followups(&self, final_text: &str, max: usize) -> Vec<String>;
}
