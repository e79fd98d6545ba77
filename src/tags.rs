//! Parser for delimited tags in generation-collaborator output.
//!
//! Model responses carry their payloads inside `<sql>…</sql>`-style markers.
//! Extraction lives here so the rest of the crate never does ad-hoc
//! `split()`-based scraping, and a missing tag is an explicit error.

use crate::error::{PilotError, Result};
use regex::Regex;

/// All occurrences of `<tag>…</tag>`, trimmed.
pub fn extract_all(text: &str, tag: &str) -> Vec<String> {
    let pattern = format!(r"(?s)<{tag}>(.*?)</{tag}>", tag = regex::escape(tag));
    let re = Regex::new(&pattern).expect("static tag pattern");
    re.captures_iter(text)
        .map(|cap| cap[1].trim().to_string())
        .collect()
}

/// First occurrence of `<tag>…</tag>`, or `TagMissing`.
pub fn extract(text: &str, tag: &str) -> Result<String> {
    extract_all(text, tag)
        .into_iter()
        .next()
        .ok_or_else(|| PilotError::TagMissing(tag.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_tag() {
        let resp = "Sure.\n<sql>\nSELECT 1\n</sql>\nDone.";
        assert_eq!(extract(resp, "sql").unwrap(), "SELECT 1");
    }

    #[test]
    fn extracts_multiline_and_multiple() {
        let resp = "<explanation>step 1\nstep 2</explanation><question_gen>alt</question_gen>";
        assert_eq!(extract(resp, "explanation").unwrap(), "step 1\nstep 2");
        assert_eq!(extract_all(resp, "question_gen"), vec!["alt".to_string()]);
    }

    #[test]
    fn missing_tag_is_an_error() {
        let err = extract("no markers here", "sql").unwrap_err();
        assert!(matches!(err, PilotError::TagMissing(t) if t == "sql"));
    }
}
