use serde::{Deserialize, Serialize};

/// A validated ad range to remove, stored in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdInterval {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl AdInterval {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    /// Build from second offsets, rounding to the nearest millisecond. Negative
    /// and non-finite inputs collapse to zero.
    pub fn from_secs(start: f64, end: f64) -> Self {
        Self {
            start_ms: secs_to_ms(start),
            end_ms: secs_to_ms(end),
        }
    }

    pub fn start_sec(&self) -> f64 {
        self.start_ms as f64 / 1000.0
    }

    pub fn end_sec(&self) -> f64 {
        self.end_ms as f64 / 1000.0
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn contains_ms(&self, t: u64) -> bool {
        self.start_ms <= t && t < self.end_ms
    }
}

pub(crate) fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

/// Caller-supplied parameters governing merging and the audio edit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemovalPolicy {
    pub min_segment_length_sec: f64,
    pub min_separation_sec: f64,
    pub fade_ms: u64,
}

impl Default for RemovalPolicy {
    fn default() -> Self {
        Self {
            min_segment_length_sec: 14.0,
            min_separation_sec: 60.0,
            fade_ms: 3000,
        }
    }
}

impl RemovalPolicy {
    pub fn merge(&self, duration_ms: u64, raw_intervals: &[(f64, f64)]) -> Vec<AdInterval> {
        merge(
            duration_ms,
            raw_intervals,
            self.min_segment_length_sec,
            self.min_separation_sec,
        )
    }
}

/// Merge raw `(start, end)` second ranges into sorted, non-overlapping intervals.
///
/// Ranges whose gap is at most `min_separation_sec` are chained into one. A
/// merged interval ending within `min_separation_sec` of the file end is pushed
/// out to `duration_ms`, and anything still shorter than `min_length_sec` is
/// dropped.
pub fn merge(
    duration_ms: u64,
    raw_intervals: &[(f64, f64)],
    min_length_sec: f64,
    min_separation_sec: f64,
) -> Vec<AdInterval> {
    let min_len_ms = secs_to_ms(min_length_sec);
    let min_sep_ms = secs_to_ms(min_separation_sec);

    let mut sorted: Vec<AdInterval> = raw_intervals
        .iter()
        .map(|&(start, end)| AdInterval::from_secs(start, end))
        .map(|iv| AdInterval::new(iv.start_ms, iv.end_ms.min(duration_ms)))
        .filter(|iv| iv.end_ms > iv.start_ms)
        .collect();

    if sorted.is_empty() {
        return Vec::new();
    }

    sorted.sort_by_key(|iv| (iv.start_ms, iv.end_ms));

    let mut merged: Vec<AdInterval> = Vec::with_capacity(sorted.len());
    let mut current = sorted[0];

    for next in sorted.iter().skip(1) {
        if next.start_ms <= current.end_ms.saturating_add(min_sep_ms) {
            current.end_ms = current.end_ms.max(next.end_ms);
        } else {
            merged.push(current);
            current = *next;
        }
    }
    merged.push(current);

    // Trailing content this close to the end is ad overrun, not programme.
    if let Some(last) = merged.last_mut() {
        if duration_ms.saturating_sub(last.end_ms) <= min_sep_ms {
            last.end_ms = duration_ms;
        }
    }

    merged.retain(|iv| iv.duration_ms() >= min_len_ms);
    merged
}

/// Complement of `intervals` within `[0, duration_ms)`, as millisecond pairs.
pub fn keep_ranges(duration_ms: u64, intervals: &[AdInterval]) -> Vec<(u64, u64)> {
    let mut keep = Vec::new();
    let mut last_end = 0u64;

    for iv in intervals {
        if iv.start_ms > last_end {
            keep.push((last_end, iv.start_ms.min(duration_ms)));
        }
        last_end = last_end.max(iv.end_ms);
    }

    if last_end < duration_ms {
        keep.push((last_end, duration_ms));
    }

    keep.retain(|(s, e)| e > s);
    keep
}

/// Total milliseconds covered by `intervals`.
pub fn removed_ms(intervals: &[AdInterval]) -> u64 {
    intervals.iter().map(AdInterval::duration_ms).sum()
}
