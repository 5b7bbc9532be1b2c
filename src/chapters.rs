//! Chapter-based ad detection and chapter re-timing after cuts.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ChapterError;
use crate::ffmpeg::MediaTools;
use crate::segments::AdInterval;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub element_id: String,
    pub title: String,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
}

/// Result of classifying an episode's chapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChapterDetection {
    pub ad_intervals: Vec<AdInterval>,
    pub chapters_kept: Vec<Chapter>,
    pub chapters_removed: Vec<Chapter>,
}

/// Flags chapters whose title contains any of a list of filter strings.
#[derive(Debug, Clone)]
pub struct ChapterAdDetector {
    filters: Vec<String>,
}

impl ChapterAdDetector {
    /// Filter strings are trimmed and lower-cased; empty entries are discarded.
    pub fn new<S: AsRef<str>>(filter_strings: &[S]) -> Self {
        let filters = filter_strings
            .iter()
            .map(|f| f.as_ref().trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect();
        Self { filters }
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn is_ad(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        self.filters.iter().any(|f| title.contains(f.as_str()))
    }

    /// Read chapters from `audio_path` and classify them. Fails with
    /// `NoChapters` when the file carries no chapter metadata at all.
    pub fn detect(
        &self,
        tools: &MediaTools,
        audio_path: &Path,
    ) -> Result<ChapterDetection, ChapterError> {
        let chapters = tools.read_chapters(audio_path)?;
        if chapters.is_empty() {
            return Err(ChapterError::NoChapters(audio_path.to_path_buf()));
        }
        let detection = self.classify(chapters);
        info!(
            path = %audio_path.display(),
            kept = detection.chapters_kept.len(),
            removed = detection.chapters_removed.len(),
            intervals = detection.ad_intervals.len(),
            "Classified chapters"
        );
        Ok(detection)
    }

    /// Split chapters into kept and removed, and turn the removed ones into ad
    /// intervals. Ad chapters that touch end to end become one interval.
    pub fn classify(&self, mut chapters: Vec<Chapter>) -> ChapterDetection {
        chapters.sort_by_key(|c| (c.start_time_ms, c.end_time_ms));

        let (chapters_removed, chapters_kept): (Vec<Chapter>, Vec<Chapter>) =
            chapters.into_iter().partition(|c| self.is_ad(&c.title));

        let mut ad_intervals: Vec<AdInterval> = Vec::new();
        for chapter in &chapters_removed {
            if chapter.end_time_ms <= chapter.start_time_ms {
                debug!(title = %chapter.title, "Skipping empty ad chapter");
                continue;
            }
            match ad_intervals.last_mut() {
                Some(last) if chapter.start_time_ms <= last.end_ms => {
                    last.end_ms = last.end_ms.max(chapter.end_time_ms);
                }
                _ => ad_intervals.push(AdInterval::new(chapter.start_time_ms, chapter.end_time_ms)),
            }
        }

        ChapterDetection {
            ad_intervals,
            chapters_kept,
            chapters_removed,
        }
    }
}

/// Removed milliseconds that precede `t`, counting the part of any interval
/// that straddles it.
fn removed_before(t: u64, removed: &[AdInterval]) -> (u64, bool) {
    let mut total = 0;
    let mut straddles = false;
    for iv in removed {
        if iv.end_ms <= t {
            total += iv.duration_ms();
        } else if iv.start_ms < t {
            total += t - iv.start_ms;
            straddles = true;
        }
    }
    (total, straddles)
}

/// Shift kept chapters to account for removed intervals.
///
/// Starts are moved back by the total removed before them. A removed interval
/// that straddles a chapter start is logged and only counted up to that start.
/// Output starts never decrease in input order and ends never precede starts.
pub fn recalculate(chapters_kept: &[Chapter], removed_intervals: &[AdInterval]) -> Vec<Chapter> {
    let mut adjusted = Vec::with_capacity(chapters_kept.len());
    let mut floor = 0u64;

    for chapter in chapters_kept {
        let (start_shift, straddles) = removed_before(chapter.start_time_ms, removed_intervals);
        if straddles {
            warn!(
                element_id = %chapter.element_id,
                title = %chapter.title,
                start_ms = chapter.start_time_ms,
                "Chapter starts inside a removed interval"
            );
        }
        let (end_shift, _) = removed_before(chapter.end_time_ms, removed_intervals);

        let start = chapter.start_time_ms.saturating_sub(start_shift).max(floor);
        let end = chapter.end_time_ms.saturating_sub(end_shift).max(start);
        floor = start;

        adjusted.push(Chapter {
            start_time_ms: start,
            end_time_ms: end,
            ..chapter.clone()
        });
    }
    adjusted
}

/// Drop chapters lying entirely inside a removed interval; the rest are returned
/// unshifted alongside the dropped ones.
pub fn drop_removed(chapters: &[Chapter], removed: &[AdInterval]) -> (Vec<Chapter>, Vec<Chapter>) {
    chapters.iter().cloned().partition(|c| {
        !removed
            .iter()
            .any(|iv| iv.start_ms <= c.start_time_ms && c.end_time_ms <= iv.end_ms)
    })
}
