pub mod analysis;
pub mod cues;
pub mod parser;
pub mod prompt;
pub mod refine;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One timed line of the upstream transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub sequence_num: u32,
    /// Seconds from the start of the audio.
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

/// Raw model claim that the segment starting near `segment_offset` is ad content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdPrediction {
    pub segment_offset: f64,
    pub confidence: f64,
}

/// What the model returns for one prompt window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdPredictionList {
    #[serde(default)]
    pub ad_segments: Vec<AdPrediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl AdPredictionList {
    pub fn content_hint(&self) -> Option<ContentTypeHint> {
        let label = self.content_type.as_deref()?.trim();
        if label.is_empty() {
            return None;
        }
        Some(ContentTypeHint {
            content_type: label.to_string(),
            confidence: self.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        })
    }
}

/// Informational label for a prediction batch, e.g. `external_promo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentTypeHint {
    pub content_type: String,
    pub confidence: f64,
}

impl ContentTypeHint {
    /// Keep whichever hint the model was more sure about.
    pub fn strongest(current: Option<Self>, candidate: Option<Self>) -> Option<Self> {
        match (current, candidate) {
            (Some(a), Some(b)) => Some(if b.confidence > a.confidence { b } else { a }),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TranscriptFile {
    Bare(Vec<TranscriptSegment>),
    Wrapped { segments: Vec<TranscriptSegment> },
}

/// Load transcript segments from JSON, either a bare array or `{"segments": [...]}`.
/// Segments come back ordered by `sequence_num`.
pub fn load_transcript(path: impl AsRef<Path>) -> Result<Vec<TranscriptSegment>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;
    let file: TranscriptFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse transcript {}", path.display()))?;

    let mut segments = match file {
        TranscriptFile::Bare(segments) | TranscriptFile::Wrapped { segments } => segments,
    };
    segments.sort_by_key(|s| s.sequence_num);

    if let Some(bad) = segments
        .iter()
        .find(|s| !s.start_time.is_finite() || !s.end_time.is_finite() || s.end_time < s.start_time)
    {
        anyhow::bail!(
            "Transcript segment {} has invalid times {}..{}",
            bad.sequence_num,
            bad.start_time,
            bad.end_time
        );
    }
    Ok(segments)
}

#[cfg(test)]
pub(crate) fn seg(sequence_num: u32, start_time: f64, end_time: f64, text: &str) -> TranscriptSegment {
    TranscriptSegment {
        sequence_num,
        start_time,
        end_time,
        text: text.to_string(),
    }
}
