//! Default follow-up/score extractor.
//!
//! The output contract asks the model for a JSON object
//! `{"score": n, "followups": ["...", ...]}` somewhere in its response.
//! Small models do not always comply, so extraction falls back to plain
//! text: a `score: n` mention and lines ending with a question mark.

use serde_json::Value;

use crate::ports::FollowupExtractor;

/// Scores are reported on a 0–100 scale.
const SCORE_RANGE: std::ops::RangeInclusive<i64> = 0..=100;

/// Keys accepted for the follow-up list.
const FOLLOWUP_KEYS: [&str; 3] = ["followups", "followUps", "follow_ups"];

/// Extractor for the JSON output contract with a plain-text fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFollowupExtractor;

impl JsonFollowupExtractor {
    pub const fn new() -> Self {
        Self
    }
}

impl FollowupExtractor for JsonFollowupExtractor {
    fn extract_score(&self, final_text: &str) -> Option<i32> {
        let raw = find_contract_object(final_text)
            .and_then(|obj| obj.get("score").and_then(score_from_value))
            .or_else(|| score_from_text(final_text))?;

        i32::try_from(raw.clamp(*SCORE_RANGE.start(), *SCORE_RANGE.end())).ok()
    }

    fn extract_followups(&self, final_text: &str, max: usize) -> Vec<String> {
        if max == 0 {
            return Vec::new();
        }

        let from_json = find_contract_object(final_text).and_then(|obj| {
            FOLLOWUP_KEYS
                .iter()
                .find_map(|key| obj.get(*key))
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(followup_from_value).collect::<Vec<_>>())
        });

        let candidates = match from_json {
            Some(items) if !items.is_empty() => items,
            _ => questions_from_text(final_text),
        };

        let mut out: Vec<String> = Vec::with_capacity(max.min(candidates.len()));
        for question in candidates {
            if out.len() == max {
                break;
            }
            if !out.iter().any(|q| q.eq_ignore_ascii_case(&question)) {
                out.push(question);
            }
        }
        out
    }
}

/// Find the first JSON object in `text` carrying a contract key.
fn find_contract_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    text.match_indices('{').find_map(|(start, _)| {
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(Value::Object(obj)))
                if obj.contains_key("score") || FOLLOWUP_KEYS.iter().any(|k| obj.contains_key(*k)) =>
            {
                Some(obj)
            }
            _ => None,
        }
    })
}

#[allow(clippy::cast_possible_truncation)] // clamped to the score range afterwards
fn score_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => leading_integer(s.trim()),
        _ => None,
    }
}

fn followup_from_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("question").and_then(Value::as_str)?,
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Find `score` (any case) followed by an integer, e.g. `Score: 85/100`.
fn score_from_text(text: &str) -> Option<i64> {
    let lower = text.to_ascii_lowercase();
    lower.match_indices("score").find_map(|(idx, word)| {
        let rest = &text[idx + word.len()..];
        let rest = rest.trim_start_matches(|c: char| c == ':' || c == '=' || c == '"' || c.is_whitespace());
        leading_integer(rest)
    })
}

fn leading_integer(s: &str) -> Option<i64> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Lines ending with `?`, with list markers stripped.
fn questions_from_text(text: &str) -> Vec<String> {
    text.lines()
        .map(strip_list_marker)
        .filter(|line| line.ends_with('?') && line.len() > 1)
        .map(str::to_string)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return stripped.trim_start();
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT_RESPONSE: &str = "The answer gives a number but no unit or season.\n\
        {\"score\": 62, \"followups\": [\"Which season was this?\", \"How large is the plot?\", \"Which crop?\"]}";

    #[test]
    fn extracts_score_from_json() {
        let extractor = JsonFollowupExtractor::new();
        assert_eq!(extractor.extract_score(CONTRACT_RESPONSE), Some(62));
    }

    #[test]
    fn extracts_followups_from_json_with_limit() {
        let extractor = JsonFollowupExtractor::new();
        let followups = extractor.extract_followups(CONTRACT_RESPONSE, 2);
        assert_eq!(
            followups,
            vec!["Which season was this?".to_string(), "How large is the plot?".to_string()]
        );
    }

    #[test]
    fn skips_unrelated_braces() {
        let text = "Use {curly} braces carefully. {\"score\": \"75\", \"followUps\": [{\"question\": \"Why?\"}]}";
        let extractor = JsonFollowupExtractor::new();
        assert_eq!(extractor.extract_score(text), Some(75));
        assert_eq!(extractor.extract_followups(text, 3), vec!["Why?".to_string()]);
    }

    #[test]
    fn score_is_clamped() {
        let extractor = JsonFollowupExtractor::new();
        assert_eq!(extractor.extract_score(r#"{"score": 140}"#), Some(100));
        assert_eq!(extractor.extract_score(r#"{"score": 87.6}"#), Some(88));
    }

    #[test]
    fn falls_back_to_plain_text() {
        let text = "Score: 40/100\nFollow-up questions:\n1. How many bags per acre?\n- Did rain affect it?\nThanks.";
        let extractor = JsonFollowupExtractor::new();
        assert_eq!(extractor.extract_score(text), Some(40));
        assert_eq!(
            extractor.extract_followups(text, 5),
            vec!["How many bags per acre?".to_string(), "Did rain affect it?".to_string()]
        );
    }

    #[test]
    fn duplicates_are_dropped() {
        let text = r#"{"followups": ["Why?", "why?", "When?"]}"#;
        let extractor = JsonFollowupExtractor::new();
        assert_eq!(
            extractor.extract_followups(text, 5),
            vec!["Why?".to_string(), "When?".to_string()]
        );
    }

    #[test]
    fn nothing_to_extract() {
        let extractor = JsonFollowupExtractor::new();
        assert_eq!(extractor.extract_score("Looks fine."), None);
        assert!(extractor.extract_followups("Looks fine.", 3).is_empty());
        assert!(extractor.extract_followups(CONTRACT_RESPONSE, 0).is_empty());
    }
}
