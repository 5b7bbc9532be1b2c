//! Turning model text into structured predictions.
//!
//! Parsing is two-stage. [`try_parse`] is a plain JSON parse of the cleaned
//! candidate; [`try_repair_and_parse`] is a best-effort fix for output that was
//! cut off mid-object. When both fail, the error reported is the one from the
//! direct parse.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::AdPredictionList;
use crate::error::{ParseError, RepairError};

/// `"key":` left hanging at the end of truncated output.
static DANGLING_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r#",?\s*"[^"]*"\s*:\s*$"#).unwrap());

/// An array element object that was never closed.
static INCOMPLETE_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\[,]\s*\{[^{}\[\]]*$").unwrap());

pub fn parse(raw: &str) -> Result<AdPredictionList, ParseError> {
    parse_json(raw)
}

/// Parse the first JSON object in `raw`, ignoring surrounding prose and
/// repairing truncation where possible.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
    let candidate = extract_candidate(raw).ok_or(ParseError::NoJsonObject)?;

    let original = match try_parse(&candidate) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    match try_repair_and_parse(&candidate) {
        Ok(value) => {
            debug!(error = %original, "Recovered truncated model output");
            Ok(value)
        }
        Err(RepairError::Balanced) => Err(ParseError::MalformedOutput {
            source: original,
            repair: None,
        }),
        Err(RepairError::StillMalformed { repaired, .. }) => Err(ParseError::MalformedOutput {
            source: original,
            repair: Some(repaired),
        }),
    }
}

pub fn try_parse<T: DeserializeOwned>(candidate: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(candidate)
}

pub fn try_repair_and_parse<T: DeserializeOwned>(candidate: &str) -> Result<T, RepairError> {
    let repaired = repair(candidate).ok_or(RepairError::Balanced)?;
    serde_json::from_str(&repaired).map_err(|source| RepairError::StillMalformed { repaired, source })
}

/// Slice from the first `{`, drop trailing prose when the braces allow it, and
/// normalise quotes and line breaks. `None` when there is no `{` at all.
pub fn extract_candidate(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut text = &raw[start..];

    if text.matches('}').count() >= text.matches('{').count() {
        if let Some(end) = text.rfind('}') {
            text = &text[..=end];
        }
    }

    let mut normalized: String = text
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            '\r' | '\n' => ' ',
            other => other,
        })
        .collect();

    if !normalized.contains('"') {
        normalized = normalized.replace('\'', "\"");
    }
    Some(normalized)
}

/// Close truncated output: strip the trailing incomplete fragment, then append
/// whatever closers the open structure needs. `None` if already balanced.
pub fn repair(candidate: &str) -> Option<String> {
    if scan(candidate).is_balanced() {
        return None;
    }

    let mut text = candidate.trim_end().to_string();
    loop {
        if let Some(quote) = scan(&text).open_string_at {
            text.truncate(quote);
        } else if text.ends_with(',') {
            text.pop();
        } else if text.ends_with(':') {
            match DANGLING_KEY.find(&text) {
                Some(m) => text.truncate(m.start()),
                None => break,
            }
        } else if let Some(m) = INCOMPLETE_OBJECT.find(&text) {
            // Keep the `[` or `,` that opened the element.
            text.truncate(m.start() + 1);
        } else {
            break;
        }
        let trimmed = text.trim_end().len();
        text.truncate(trimmed);
    }

    let closers: String = scan(&text)
        .stack
        .iter()
        .rev()
        .map(|open| if *open == '{' { '}' } else { ']' })
        .collect();
    text.push_str(&closers);
    Some(text)
}

struct Scan {
    /// Unclosed `{` / `[` in opening order.
    stack: Vec<char>,
    /// Byte offset of the quote that opened an unterminated string.
    open_string_at: Option<usize>,
}

impl Scan {
    fn is_balanced(&self) -> bool {
        self.stack.is_empty() && self.open_string_at.is_none()
    }
}

fn scan(text: &str) -> Scan {
    let mut stack = Vec::new();
    let mut open_string_at = None;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if open_string_at.is_some() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                open_string_at = None;
            }
            continue;
        }
        match c {
            '"' => open_string_at = Some(i),
            '{' | '[' => stack.push(c),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    Scan {
        stack,
        open_string_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(list: &AdPredictionList) -> Vec<(f64, f64)> {
        list.ad_segments
            .iter()
            .map(|p| (p.segment_offset, p.confidence))
            .collect()
    }

    #[test]
    fn test_well_formed() {
        let list = parse(
            r#"{"ad_segments": [{"segment_offset": 59.8, "confidence": 0.97}], "content_type": "external_promo", "confidence": 0.9}"#,
        )
        .unwrap();
        assert_eq!(offsets(&list), vec![(59.8, 0.97)]);
        assert_eq!(list.content_type.as_deref(), Some("external_promo"));
    }

    #[test]
    fn test_empty_ads_is_valid() {
        let list = parse(r#"{"ad_segments": []}"#).unwrap();
        assert!(list.ad_segments.is_empty());
        assert!(list.content_hint().is_none());
    }

    #[test]
    fn test_surrounding_prose_ignored() {
        let raw = "Sure! Here is my analysis:\n{\"ad_segments\": [{\"segment_offset\": 12.0,\n \"confidence\": 0.9}]}\nLet me know if you need more.";
        assert_eq!(offsets(&parse(raw).unwrap()), vec![(12.0, 0.9)]);
    }

    #[test]
    fn test_truncated_after_object() {
        let list = parse(r#"{"ad_segments":[{"segment_offset":10.5,"confidence":0.92}"#).unwrap();
        assert_eq!(offsets(&list), vec![(10.5, 0.92)]);
    }

    #[test]
    fn test_truncated_after_comma() {
        let list = parse(
            r#"{"ad_segments":[{"segment_offset":1.0,"confidence":0.9},{"segment_offset":2.0,"confidence":0.8},"#,
        )
        .unwrap();
        assert_eq!(offsets(&list), vec![(1.0, 0.9), (2.0, 0.8)]);
    }

    #[test]
    fn test_truncated_inside_element_drops_it() {
        let list = parse(
            r#"{"ad_segments":[{"segment_offset":1.0,"confidence":0.9},{"segment_offset":2.0,"conf"#,
        )
        .unwrap();
        assert_eq!(offsets(&list), vec![(1.0, 0.9)]);
    }

    #[test]
    fn test_truncated_inside_string_value() {
        let list = parse(
            r#"{"ad_segments":[{"segment_offset":4.0,"confidence":0.95}],"content_type":"external_pr"#,
        )
        .unwrap();
        assert_eq!(offsets(&list), vec![(4.0, 0.95)]);
        assert!(list.content_type.is_none());
    }

    #[test]
    fn test_unrepairable_is_error_not_empty() {
        let err = parse(r#"{"ad_segments": uhoh..."#).unwrap_err();
        match err {
            ParseError::MalformedOutput { source, repair } => {
                // The direct parse error is reported, not the repair's.
                assert!(source.is_syntax() || source.is_eof());
                assert_eq!(repair.as_deref(), Some(r#"{"ad_segments": uhoh...}"#));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_no_object_is_hard_failure() {
        assert!(matches!(
            parse("There are no advertisements in this excerpt."),
            Err(ParseError::NoJsonObject)
        ));
    }

    #[test]
    fn test_balanced_but_wrong_shape() {
        let err = parse(r#"{"ad_segments": [1, 2]}"#).unwrap_err();
        assert!(matches!(err, ParseError::MalformedOutput { repair: None, .. }));
    }

    #[test]
    fn test_quote_normalisation() {
        let list = parse("{'ad_segments': [{'segment_offset': 5.0, 'confidence': 0.85}]}").unwrap();
        assert_eq!(offsets(&list), vec![(5.0, 0.85)]);

        let list = parse("{\u{201C}ad_segments\u{201D}: []}").unwrap();
        assert!(list.ad_segments.is_empty());
    }

    #[test]
    fn test_repair_closes_brackets_before_braces() {
        assert_eq!(
            repair(r#"{"ad_segments":[{"segment_offset":1,"confidence":1}"#).as_deref(),
            Some(r#"{"ad_segments":[{"segment_offset":1,"confidence":1}]}"#)
        );
        assert_eq!(repair(r#"{"ad_segments":[]}"#), None);
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let list = parse(r#"{"ad_segments":[],"content_type":"say \"hi\" {"}"#).unwrap();
        assert_eq!(list.content_type.as_deref(), Some(r#"say "hi" {"#));
    }
}
