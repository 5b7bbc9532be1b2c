//! Tightening coarse ad boundaries.
//!
//! The model sees the candidate interval plus a few segments of context on each
//! side and proposes new edges. If the call or its output fails, intro and outro
//! phrases in the context decide instead. Either way the proposal is clamped to
//! the configured extension caps before it is used.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::analysis::DetectionContext;
use super::{cues, parser, prompt, TranscriptSegment};
use crate::config::DetectionConfig;
use crate::error::{CallError, CallResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedBoundary {
    pub refined_start: f64,
    pub refined_end: f64,
    #[serde(default)]
    pub start_reason: String,
    #[serde(default)]
    pub end_reason: String,
}

impl RefinedBoundary {
    /// The unrefined interval, as returned when a refinement is rejected.
    pub fn coarse(ad_start: f64, ad_end: f64) -> Self {
        Self {
            refined_start: ad_start,
            refined_end: ad_end,
            start_reason: "heuristic".to_string(),
            end_reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtensionLimits {
    pub max_start_extension_sec: f64,
    pub max_end_extension_sec: f64,
}

impl From<&DetectionConfig> for ExtensionLimits {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            max_start_extension_sec: config.max_start_extension_sec,
            max_end_extension_sec: config.max_end_extension_sec,
        }
    }
}

const REFINEMENT_SYSTEM: &str = r#"You refine the boundaries of advertisements in podcast transcripts.

You are given the approximate start and end of one ad and the transcript around it, one segment per line as `[start] text`. Find where the ad really begins (the first words of the sponsor introduction) and where it really ends (the last words before the show resumes).

Respond with a single JSON object and nothing else:
{"refined_start": <seconds>, "refined_end": <seconds>, "start_reason": "<short explanation>", "end_reason": "<short explanation>"}"#;

/// Segments overlapping `[ad_start, ad_end]` plus up to `context` segments on
/// either side, counted by position rather than time.
pub fn context_window(
    ad_start: f64,
    ad_end: f64,
    segments: &[TranscriptSegment],
    context: usize,
) -> &[TranscriptSegment] {
    if segments.is_empty() {
        return segments;
    }

    let overlapping = |s: &TranscriptSegment| s.end_time > ad_start && s.start_time < ad_end;
    let (first, last) = match segments.iter().position(overlapping) {
        Some(first) => {
            let last = segments.iter().rposition(overlapping).unwrap_or(first);
            (first, last)
        }
        None => {
            let at = segments
                .partition_point(|s| s.start_time < ad_start)
                .min(segments.len() - 1);
            (at, at)
        }
    };

    let lo = first.saturating_sub(context);
    let hi = (last + context).min(segments.len() - 1);
    &segments[lo..=hi]
}

pub fn refinement_prompt(
    ad_start: f64,
    ad_end: f64,
    confidence: f64,
    window: &[TranscriptSegment],
) -> String {
    format!(
        "Approximate ad interval: {:.1}s to {:.1}s (detection confidence {:.2}).\n\nTranscript:\n{}",
        ad_start,
        ad_end,
        confidence,
        prompt::build(window, false, false)
    )
}

/// Widen the interval to the earliest sponsor intro before it and the latest
/// sponsor outro after it, within `window`.
pub fn heuristic(ad_start: f64, ad_end: f64, window: &[TranscriptSegment]) -> RefinedBoundary {
    let intro = window
        .iter()
        .filter(|s| s.start_time < ad_start)
        .find(|s| cues::is_intro_marker(&s.text));
    let outro = window
        .iter()
        .filter(|s| s.start_time >= ad_end)
        .rev()
        .find(|s| cues::is_outro_marker(&s.text));

    RefinedBoundary {
        refined_start: intro.map_or(ad_start, |s| s.start_time),
        refined_end: outro.map_or(ad_end, |s| s.end_time.max(ad_end)),
        start_reason: match intro {
            Some(s) => format!("heuristic: sponsor intro at {:.1}s", s.start_time),
            None => "heuristic".to_string(),
        },
        end_reason: match outro {
            Some(s) => format!("heuristic: sponsor outro at {:.1}s", s.start_time),
            None => "heuristic".to_string(),
        },
    }
}

/// Clamp a proposal to the extension caps. A proposal that ends up empty,
/// inverted or non-finite is replaced by the coarse interval.
pub fn validate(
    proposed: RefinedBoundary,
    ad_start: f64,
    ad_end: f64,
    limits: &ExtensionLimits,
) -> RefinedBoundary {
    if !proposed.refined_start.is_finite() || !proposed.refined_end.is_finite() {
        debug!(ad_start, ad_end, "Discarding non-finite refinement");
        return RefinedBoundary::coarse(ad_start, ad_end);
    }

    let start = proposed
        .refined_start
        .max(ad_start - limits.max_start_extension_sec)
        .max(0.0);
    let end = proposed
        .refined_end
        .min(ad_end + limits.max_end_extension_sec);

    if start >= end {
        debug!(
            ad_start,
            ad_end,
            proposed_start = proposed.refined_start,
            proposed_end = proposed.refined_end,
            "Discarding inverted refinement"
        );
        return RefinedBoundary::coarse(ad_start, ad_end);
    }

    RefinedBoundary {
        refined_start: start,
        refined_end: end,
        ..proposed
    }
}

/// Refine one coarse interval. Never fails: model problems fall back to the
/// heuristic, and invalid results fall back to the coarse bounds.
pub async fn refine(
    ctx: &DetectionContext<'_>,
    ad_start: f64,
    ad_end: f64,
    confidence: f64,
    segments: &[TranscriptSegment],
) -> RefinedBoundary {
    let window = context_window(
        ad_start,
        ad_end,
        segments,
        ctx.detection.refinement_context_segments,
    );
    let limits = ExtensionLimits::from(ctx.detection);

    let proposed = match model_refinement(ctx, ad_start, ad_end, confidence, window).await {
        Ok(boundary) => boundary,
        Err(e) => {
            warn!(
                job_id = ctx.job_id,
                ad_start,
                ad_end,
                "Boundary refinement failed, using heuristic: {}",
                e
            );
            heuristic(ad_start, ad_end, window)
        }
    };

    let refined = validate(proposed, ad_start, ad_end, &limits);
    debug!(
        job_id = ctx.job_id,
        ad_start,
        ad_end,
        refined_start = refined.refined_start,
        refined_end = refined.refined_end,
        start_reason = %refined.start_reason,
        "Refined ad boundary"
    );
    refined
}

async fn model_refinement(
    ctx: &DetectionContext<'_>,
    ad_start: f64,
    ad_end: f64,
    confidence: f64,
    window: &[TranscriptSegment],
) -> CallResult<RefinedBoundary> {
    let (first, last) = match (window.first(), window.last()) {
        (Some(first), Some(last)) => (first.sequence_num, last.sequence_num),
        _ => return Err(CallError::EmptyResponse),
    };

    let text = ctx
        .call_model(
            REFINEMENT_SYSTEM,
            refinement_prompt(ad_start, ad_end, confidence, window),
            first,
            last,
        )
        .await?;
    Ok(parser::parse_json::<RefinedBoundary>(&text)?)
}
