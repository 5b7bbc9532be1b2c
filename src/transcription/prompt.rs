//! Prompt text for ad detection.
//!
//! Every segment renders as `[start] text` with the start time at one decimal
//! place, which is also the precision the model is asked to echo back as
//! `segment_offset`.

use once_cell::sync::Lazy;

use super::cues;
use super::TranscriptSegment;

pub const TRANSCRIPT_START: &str = "[TRANSCRIPT START]";
pub const TRANSCRIPT_END: &str = "[TRANSCRIPT END]";

pub fn build(
    segments: &[TranscriptSegment],
    include_transcript_start_marker: bool,
    include_transcript_end_marker: bool,
) -> String {
    render(
        segments,
        include_transcript_start_marker,
        include_transcript_end_marker,
        |text| text.trim().to_string(),
    )
}

/// Same as [`build`], with lexical cues wrapped in highlight markers.
pub fn build_highlighted(
    segments: &[TranscriptSegment],
    include_transcript_start_marker: bool,
    include_transcript_end_marker: bool,
) -> String {
    render(
        segments,
        include_transcript_start_marker,
        include_transcript_end_marker,
        |text| cues::highlight(text.trim()),
    )
}

fn render(
    segments: &[TranscriptSegment],
    start_marker: bool,
    end_marker: bool,
    text: impl Fn(&str) -> String,
) -> String {
    let mut lines = Vec::with_capacity(segments.len() + 2);
    if start_marker {
        lines.push(TRANSCRIPT_START.to_string());
    }
    for segment in segments {
        lines.push(format!("[{:.1}] {}", segment.start_time, text(&segment.text)));
    }
    if end_marker {
        lines.push(TRANSCRIPT_END.to_string());
    }
    lines.join("\n")
}

/// The transcript excerpt used as the one-shot example in the system prompt.
pub fn example_segments() -> Vec<TranscriptSegment> {
    [
        (53.8, 59.8, "That's a great point, and I think it's what most founders miss."),
        (59.8, 64.2, "Before we go on, this episode is brought to you by Linear."),
        (64.2, 71.5, "Linear is the issue tracker built for high-performance teams."),
        (71.5, 75.0, "Go to linear.app slash podcast and use code PODCAST for 20% off."),
        (75.0, 78.9, "Alright, back to the interview."),
        (78.9, 84.3, "So you were telling me about the early days of the company."),
    ]
    .into_iter()
    .enumerate()
    .map(|(i, (start_time, end_time, text))| TranscriptSegment {
        sequence_num: 412 + i as u32,
        start_time,
        end_time,
        text: text.to_string(),
    })
    .collect()
}

/// Expected answer for [`example_segments`].
pub const EXAMPLE_OUTPUT: &str = r#"{"ad_segments": [{"segment_offset": 59.8, "confidence": 0.97}, {"segment_offset": 64.2, "confidence": 0.98}, {"segment_offset": 71.5, "confidence": 0.99}], "content_type": "external_promo", "confidence": 0.96}"#;

pub fn example_prompt(highlight_cues: bool) -> String {
    if highlight_cues {
        build_highlighted(&example_segments(), false, false)
    } else {
        build(&example_segments(), false, false)
    }
}

static SYSTEM_PROMPT: Lazy<String> = Lazy::new(|| system_prompt_text(false));
static SYSTEM_PROMPT_HIGHLIGHTED: Lazy<String> = Lazy::new(|| system_prompt_text(true));

/// System instructions for ad detection, with the one-shot example embedded.
pub fn system_prompt(highlight_cues: bool) -> &'static str {
    if highlight_cues {
        SYSTEM_PROMPT_HIGHLIGHTED.as_str()
    } else {
        SYSTEM_PROMPT.as_str()
    }
}

fn system_prompt_text(highlight_cues: bool) -> String {
    let cue_note = if highlight_cues {
        "\nPhrases that often signal advertising (URLs, promo codes, calls to action, sponsor transitions) are wrapped in *** markers. A marker is a hint, not proof: hosts also mention websites in ordinary conversation.\n"
    } else {
        ""
    };

    format!(
        r#"You are an expert at finding advertisements in podcast transcripts.

Each line of the transcript is one segment in the form `[start] text`, where start is the segment's start time in seconds. {start} marks the beginning of the episode and {end} marks its end; when they are absent the excerpt comes from the middle of the episode.

Identify every segment that is part of an advertisement or sponsor read: host-read ads, pre-recorded spots, promo codes, and plugs for other shows. Discussion of a product that is part of the episode's actual topic is not an ad. Include the segments that introduce and close the ad, but not the surrounding conversation.
{cue_note}
Respond with a single JSON object and nothing else:
{{"ad_segments": [{{"segment_offset": <start of an ad segment, copied from its line>, "confidence": <0.0 to 1.0>}}], "content_type": <one of "technical_discussion", "self_promo", "external_promo", "transition", "other">, "confidence": <0.0 to 1.0>}}

If there are no ads, respond with {{"ad_segments": []}}.

Example transcript:
{example}

Example response:
{output}"#,
        start = TRANSCRIPT_START,
        end = TRANSCRIPT_END,
        cue_note = cue_note,
        example = example_prompt(highlight_cues),
        output = EXAMPLE_OUTPUT,
    )
}
