//! Lexical ad cues: URLs, promo phrases, calls to action, sponsor transitions.
//!
//! Highlighting wraps each cue span in `*** ` / ` ***` so the model's attention
//! is drawn to it. Spans from different classes that overlap or sit next to
//! each other (separated only by whitespace) are merged into one marker pair.
//! Text already inside a marker pair is left alone, which makes `highlight`
//! idempotent as long as the markers themselves never match a cue pattern.

use once_cell::sync::Lazy;
use regex::Regex;

pub const MARK_OPEN: &str = "*** ";
pub const MARK_CLOSE: &str = " ***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CueKind {
    Url,
    Promo,
    CallToAction,
    Transition,
}

/// Byte span of one cue match inside the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cue {
    pub kind: CueKind,
    pub start: usize,
    pub end: usize,
}

static CUE_PATTERNS: Lazy<Vec<(CueKind, Regex)>> = Lazy::new(|| {
    [
        (
            CueKind::Url,
            r"(?i)\b(?:https?://)?(?:www\.)?[a-z0-9][a-z0-9-]*(?:\.[a-z0-9-]+)*\.(?:com|net|org|io|co|fm|ly|tv|app|ai|me|us|uk|ca|de|shop|store)\b(?:(?:/| slash )[a-z0-9_-]+)*|\b[a-z0-9-]+ dot (?:com|net|org|io|co|fm|app)\b(?: slash [a-z0-9_-]+)*",
        ),
        (
            CueKind::Promo,
            r"(?i)\b(?:promo|discount|coupon|offer) code\b|\buse (?:the )?code\s+[a-z0-9_-]+|\b\d{1,3}\s?(?:%|percent) off\b|\bfree trial\b|\bfirst (?:month|order|box|week) (?:is )?free\b|\bspecial offer\b|\bexclusive (?:deal|offer|discount)\b",
        ),
        (
            CueKind::CallToAction,
            r"(?i)\b(?:go to|head (?:over )?to|visit|check out|sign up|download|subscribe|click the link|link in (?:the )?(?:show notes|description))\b",
        ),
        (
            CueKind::Transition,
            r"(?i)\b(?:brought to you by|sponsored by|(?:today's|this episode's|our) sponsor|a word from (?:our|this week's|today's) sponsors?|support for (?:this|the) (?:show|podcast|episode) comes from|thanks to our sponsors?|(?:and now )?back to the (?:show|episode|interview|conversation))\b",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).unwrap()))
    .collect()
});

static HIGHLIGHTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*\* .*? \*\*\*").unwrap());

/// Phrases announcing a sponsor read, used when scanning backwards for an ad start.
static INTRO_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:sponsor(?:ed|s)?|brought to you by|a word from|support for (?:this|the) (?:show|podcast|episode)|partner(?:ed|ing)? with|before we (?:get started|begin|continue)|quick break|let me tell you about|today's episode is)\b",
    )
    .unwrap()
});

/// Phrases that close a sponsor read, used when scanning forwards for an ad end.
static OUTRO_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b[a-z0-9-]+\.(?:com|net|org|io|co|fm|app)\b|\b[a-z0-9-]+ dot (?:com|net|org|io|co|fm|app)\b|\buse (?:the )?code\b|\bthanks to\b|\bvisit\b",
    )
    .unwrap()
});

/// Every cue match in `text`, ordered by start offset.
pub fn find_cues(text: &str) -> Vec<Cue> {
    let mut cues: Vec<Cue> = CUE_PATTERNS
        .iter()
        .flat_map(|(kind, pattern)| {
            pattern.find_iter(text).map(move |m| Cue {
                kind: *kind,
                start: m.start(),
                end: m.end(),
            })
        })
        .collect();
    cues.sort_by_key(|c| (c.start, std::cmp::Reverse(c.end)));
    cues
}

pub fn is_intro_marker(text: &str) -> bool {
    INTRO_MARKERS.is_match(text)
}

pub fn is_outro_marker(text: &str) -> bool {
    OUTRO_MARKERS.is_match(text)
}

/// Wrap every cue in `text` with highlight markers. Returns the input unchanged
/// when nothing matches.
pub fn highlight(text: &str) -> String {
    let existing: Vec<(usize, usize)> = HIGHLIGHTED
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();

    let spans = merge_spans(
        text,
        find_cues(text)
            .into_iter()
            .filter(|c| !existing.iter().any(|&(s, e)| c.start < e && s < c.end))
            .map(|c| (c.start, c.end)),
    );

    if spans.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len() + spans.len() * 8);
    let mut cursor = 0;
    for (start, end) in spans {
        out.push_str(&text[cursor..start]);
        out.push_str(MARK_OPEN);
        out.push_str(&text[start..end]);
        out.push_str(MARK_CLOSE);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Coalesce sorted spans that overlap or are separated only by whitespace.
fn merge_spans(text: &str, spans: impl Iterator<Item = (usize, usize)>) -> Vec<(usize, usize)> {
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 || text[last.1..start].trim().is_empty() => {
                last.1 = last.1.max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cues_returns_input() {
        let text = "We talked about the history of the printing press.";
        assert_eq!(highlight(text), text);
        assert!(find_cues(text).is_empty());
    }

    #[test]
    fn test_each_cue_class_detected() {
        let kinds = |t: &str| find_cues(t).into_iter().map(|c| c.kind).collect::<Vec<_>>();
        assert_eq!(kinds("see example.com for more"), vec![CueKind::Url]);
        assert_eq!(kinds("it has a free trial"), vec![CueKind::Promo]);
        assert_eq!(kinds("please subscribe"), vec![CueKind::CallToAction]);
        assert_eq!(kinds("this show is sponsored by Acme"), vec![CueKind::Transition]);
    }

    #[test]
    fn test_adjacent_cues_merge_into_one_span() {
        let out = highlight("Go to linear.app slash podcast and use code PODCAST for 20% off.");
        assert_eq!(
            out,
            "*** Go to linear.app slash podcast *** and *** use code PODCAST *** for *** 20% off ***."
        );
    }

    #[test]
    fn test_overlapping_cues_not_double_marked() {
        // "visit" (call to action) is followed directly by a URL.
        let out = highlight("visit https://www.acme.com/deal today");
        assert_eq!(out, "*** visit https://www.acme.com/deal *** today");
        assert_eq!(out.matches("***").count(), 2);
    }

    #[test]
    fn test_highlight_idempotent_on_representative_inputs() {
        for text in [
            "This episode is brought to you by Linear.",
            "Head over to acme dot com slash show for a free trial.",
            "Use code SAVE for 15 percent off your first order.",
            "And now back to the show.",
            "Nothing to see here.",
        ] {
            let once = highlight(text);
            assert_eq!(highlight(&once), once, "{text}");
        }
    }

    #[test]
    fn test_intro_and_outro_markers() {
        assert!(is_intro_marker("Today's episode is sponsored by Acme."));
        assert!(is_intro_marker("Let me tell you about our friends at Acme."));
        assert!(!is_intro_marker("So back in 2012 we started the company."));

        assert!(is_outro_marker("Just use code RUST at checkout."));
        assert!(is_outro_marker("Thanks to Acme for supporting the show."));
        assert!(is_outro_marker("That's acme.com."));
        assert!(!is_outro_marker("Anyway, where were we?"));
    }
}
