use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::refine::{self, RefinedBoundary};
use super::{parser, prompt, AdPrediction, AdPredictionList, ContentTypeHint, TranscriptSegment};
use crate::config::{DetectionConfig, LlmConfig};
use crate::error::{CallError, CallResult};
use crate::llm::{call_with_retry, CompletionRequest, ConcurrencyLimiter, LanguageModel, RetryPolicy};
use crate::processor::{CallStatus, ModelCallRecord, RecordCommand, RecordSink};

/// How far a `segment_offset` may sit from a segment start and still name it.
const OFFSET_TOLERANCE_SEC: f64 = 1.0;

/// Whole-call reissues when the model's answer cannot be parsed.
const MAX_PARSE_ATTEMPTS: u32 = 2;

/// Everything a detection pass needs, borrowed from the processor for one job.
pub struct DetectionContext<'a> {
    pub job_id: &'a str,
    /// Model identifier sent with every request.
    pub model_name: &'a str,
    pub model: &'a dyn LanguageModel,
    pub limiter: &'a ConcurrencyLimiter,
    pub retry: &'a RetryPolicy,
    pub llm: &'a LlmConfig,
    pub detection: &'a DetectionConfig,
    pub records: &'a dyn RecordSink,
    pub cancel: &'a CancellationToken,
}

impl DetectionContext<'_> {
    /// One model call under the shared limiter and retry policy. The outcome,
    /// success or failure, is submitted to the record sink.
    pub async fn call_model(
        &self,
        system: &str,
        prompt: String,
        first_seq: u32,
        last_seq: u32,
    ) -> CallResult<String> {
        let request = CompletionRequest {
            model: self.model_name.to_string(),
            system: system.to_string(),
            prompt,
            max_tokens: self.llm.max_tokens,
            temperature: self.llm.temperature,
        };

        let label = format!("{}:{}-{}", self.job_id, first_seq, last_seq);
        let outcome = call_with_retry(self.limiter, self.retry, self.cancel, &label, || {
            self.model.complete(&request)
        })
        .await;

        let record = match &outcome {
            Ok(attempted) => ModelCallRecord {
                job_id: self.job_id.to_string(),
                model: request.model.clone(),
                first_seq,
                last_seq,
                prompt: request.prompt.clone(),
                response: Some(attempted.value.clone()),
                status: CallStatus::Success,
                error: None,
                attempts: attempted.attempts,
            },
            Err(e) => ModelCallRecord {
                job_id: self.job_id.to_string(),
                model: request.model.clone(),
                first_seq,
                last_seq,
                prompt: request.prompt.clone(),
                response: None,
                status: CallStatus::Failed,
                error: Some(e.to_string()),
                attempts: match e {
                    CallError::Transient { attempts, .. } => *attempts,
                    _ => 1,
                },
            },
        };
        self.submit(RecordCommand::ModelCall(record));

        outcome.map(|attempted| attempted.value)
    }

    fn submit(&self, command: RecordCommand) {
        if let Err(e) = self.records.submit(command) {
            warn!(job_id = self.job_id, "Failed to submit record: {:#}", e);
        }
    }
}

/// A contiguous run of segments sent to the model in one prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptWindow<'a> {
    pub index: usize,
    pub segments: &'a [TranscriptSegment],
    pub is_first: bool,
    pub is_last: bool,
}

impl PromptWindow<'_> {
    pub fn render(&self, highlight_cues: bool) -> String {
        if highlight_cues {
            prompt::build_highlighted(self.segments, self.is_first, self.is_last)
        } else {
            prompt::build(self.segments, self.is_first, self.is_last)
        }
    }

    pub fn first_seq(&self) -> u32 {
        self.segments.first().map_or(0, |s| s.sequence_num)
    }

    pub fn last_seq(&self) -> u32 {
        self.segments.last().map_or(0, |s| s.sequence_num)
    }
}

/// Split segments into windows of `per_prompt`, each repeating the last
/// `overlap` segments of the previous one.
pub fn prompt_windows(
    segments: &[TranscriptSegment],
    per_prompt: usize,
    overlap: usize,
) -> Vec<PromptWindow<'_>> {
    if segments.is_empty() {
        return Vec::new();
    }

    let per_prompt = per_prompt.max(1);
    let step = per_prompt - overlap.min(per_prompt - 1);
    let mut windows = Vec::new();
    let mut start = 0;

    loop {
        let end = (start + per_prompt).min(segments.len());
        windows.push(PromptWindow {
            index: windows.len(),
            segments: &segments[start..end],
            is_first: start == 0,
            is_last: end == segments.len(),
        });
        if end == segments.len() {
            break;
        }
        start += step;
    }
    windows
}

/// A transcript segment the model flagged as ad content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub sequence_num: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
}

/// Resolve each confident prediction to the segment whose start is nearest its
/// offset, or failing that to the segment whose span contains it. Predictions
/// that name no segment in `window` are dropped.
pub fn map_predictions(
    window: &[TranscriptSegment],
    predictions: &[AdPrediction],
    min_confidence: f64,
) -> Vec<Identification> {
    let mut out = Vec::new();

    for prediction in predictions {
        let offset = prediction.segment_offset;
        if !offset.is_finite() || !prediction.confidence.is_finite() {
            continue;
        }
        if prediction.confidence < min_confidence {
            debug!(offset, confidence = prediction.confidence, "Prediction below confidence threshold");
            continue;
        }

        let nearest = window
            .iter()
            .min_by(|a, b| {
                (a.start_time - offset)
                    .abs()
                    .total_cmp(&(b.start_time - offset).abs())
            })
            .filter(|segment| (segment.start_time - offset).abs() <= OFFSET_TOLERANCE_SEC);
        let matched = nearest.or_else(|| {
            window
                .iter()
                .find(|segment| segment.start_time <= offset && offset < segment.end_time)
        });
        match matched {
            Some(segment) => out.push(Identification {
                sequence_num: segment.sequence_num,
                start_time: segment.start_time,
                end_time: segment.end_time,
                confidence: prediction.confidence.min(1.0),
            }),
            None => debug!(offset, "Prediction does not match any segment in window"),
        }
    }
    out
}

/// Unrefined ad interval spanning a run of consecutive flagged segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoarseInterval {
    pub start: f64,
    pub end: f64,
    pub confidence: f64,
    pub first_seq: u32,
    pub last_seq: u32,
}

/// Group identifications (sorted by sequence number) into runs of consecutive
/// sequence numbers.
pub fn group_identified(identified: &[Identification]) -> Vec<CoarseInterval> {
    let mut groups: Vec<CoarseInterval> = Vec::new();

    for id in identified {
        match groups.last_mut() {
            Some(group) if id.sequence_num == group.last_seq + 1 => {
                group.end = group.end.max(id.end_time);
                group.last_seq = id.sequence_num;
                group.confidence = group.confidence.max(id.confidence);
            }
            _ => groups.push(CoarseInterval {
                start: id.start_time,
                end: id.end_time,
                confidence: id.confidence,
                first_seq: id.sequence_num,
                last_seq: id.sequence_num,
            }),
        }
    }
    groups
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionOutcome {
    pub identifications: Vec<Identification>,
    pub coarse: Vec<CoarseInterval>,
    /// One per coarse interval, same order.
    pub boundaries: Vec<RefinedBoundary>,
    pub content_type: Option<ContentTypeHint>,
}

impl DetectionOutcome {
    /// Refined `(start, end)` pairs in seconds, ready for merging.
    pub fn raw_intervals(&self) -> Vec<(f64, f64)> {
        self.boundaries
            .iter()
            .map(|b| (b.refined_start, b.refined_end))
            .collect()
    }
}

/// Run model-driven detection over the whole transcript.
pub async fn detect_ads(
    ctx: &DetectionContext<'_>,
    segments: &[TranscriptSegment],
) -> CallResult<DetectionOutcome> {
    let windows = prompt_windows(
        segments,
        ctx.detection.segments_per_prompt,
        ctx.detection.window_overlap,
    );
    let system = prompt::system_prompt(ctx.detection.use_cue_highlighting);

    info!(
        job_id = ctx.job_id,
        segments = segments.len(),
        windows = windows.len(),
        model = ctx.model_name,
        "Starting ad detection"
    );

    let mut identified: BTreeMap<u32, Identification> = BTreeMap::new();
    let mut content_type: Option<ContentTypeHint> = None;

    for window in &windows {
        if ctx.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let predictions = detect_window(ctx, system, window).await?;
        content_type = ContentTypeHint::strongest(content_type, predictions.content_hint());

        let found = map_predictions(
            window.segments,
            &predictions.ad_segments,
            ctx.detection.min_confidence,
        );
        debug!(
            job_id = ctx.job_id,
            window = window.index,
            predictions = predictions.ad_segments.len(),
            identified = found.len(),
            "Window analysed"
        );

        // Overlapping windows can flag the same segment twice.
        for id in found {
            identified
                .entry(id.sequence_num)
                .and_modify(|existing| existing.confidence = existing.confidence.max(id.confidence))
                .or_insert(id);
        }
    }

    let identifications: Vec<Identification> = identified.into_values().collect();
    ctx.submit(RecordCommand::Identifications {
        job_id: ctx.job_id.to_string(),
        identifications: identifications.clone(),
        content_type: content_type.clone(),
    });

    let coarse = group_identified(&identifications);
    let mut boundaries = Vec::with_capacity(coarse.len());
    for interval in &coarse {
        // Once cancelled, remaining intervals keep their coarse bounds.
        let boundary = if ctx.detection.refine_boundaries && !ctx.cancel.is_cancelled() {
            refine::refine(ctx, interval.start, interval.end, interval.confidence, segments).await
        } else {
            RefinedBoundary {
                refined_start: interval.start,
                refined_end: interval.end,
                start_reason: "coarse".to_string(),
                end_reason: "coarse".to_string(),
            }
        };
        boundaries.push(boundary);
    }

    info!(
        job_id = ctx.job_id,
        identified = identifications.len(),
        intervals = coarse.len(),
        content_type = content_type.as_ref().map(|h| h.content_type.as_str()),
        "Ad detection complete"
    );

    Ok(DetectionOutcome {
        identifications,
        coarse,
        boundaries,
        content_type,
    })
}

async fn detect_window(
    ctx: &DetectionContext<'_>,
    system: &str,
    window: &PromptWindow<'_>,
) -> CallResult<AdPredictionList> {
    let mut attempt = 1;
    loop {
        let text = ctx
            .call_model(
                system,
                window.render(ctx.detection.use_cue_highlighting),
                window.first_seq(),
                window.last_seq(),
            )
            .await?;

        match parser::parse(&text) {
            Ok(list) => return Ok(list),
            Err(e) if attempt < MAX_PARSE_ATTEMPTS => {
                warn!(
                    job_id = ctx.job_id,
                    window = window.index,
                    attempt,
                    "Unparseable model output, reissuing call: {}",
                    e
                );
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use super::*;
    use crate::llm::scripted::ScriptedModel;
    use crate::processor::MemoryRecordSink;

    pub(crate) struct Harness {
        pub model: ScriptedModel,
        pub limiter: ConcurrencyLimiter,
        pub retry: RetryPolicy,
        pub llm: LlmConfig,
        pub detection: DetectionConfig,
        pub records: MemoryRecordSink,
        pub cancel: CancellationToken,
    }

    impl Harness {
        pub(crate) fn new(model: ScriptedModel) -> Self {
            Self {
                model,
                limiter: ConcurrencyLimiter::new(2).unwrap(),
                retry: RetryPolicy {
                    max_attempts: 2,
                    max_backoff: Duration::from_millis(1),
                    call_timeout: Duration::from_secs(5),
                    slot_timeout: Duration::from_secs(1),
                },
                llm: LlmConfig::default(),
                detection: DetectionConfig::default(),
                records: MemoryRecordSink::default(),
                cancel: CancellationToken::new(),
            }
        }

        pub(crate) fn replying(text: &str) -> Self {
            Self::new(ScriptedModel::replying(text))
        }

        pub(crate) fn ctx(&self) -> DetectionContext<'_> {
            DetectionContext {
                job_id: "job-test",
                model_name: "test-model",
                model: &self.model,
                limiter: &self.limiter,
                retry: &self.retry,
                llm: &self.llm,
                detection: &self.detection,
                records: &self.records,
                cancel: &self.cancel,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Harness;
    use super::*;
    use crate::llm::scripted::ScriptedModel;
    use crate::transcription::seg;

    fn segments(n: u32) -> Vec<TranscriptSegment> {
        (1..=n)
            .map(|i| seg(i, (i - 1) as f64 * 5.0, i as f64 * 5.0, "talk"))
            .collect()
    }

    fn prediction(offset: f64, confidence: f64) -> AdPrediction {
        AdPrediction {
            segment_offset: offset,
            confidence,
        }
    }

    #[test]
    fn test_prompt_windows_without_overlap() {
        let segs = segments(7);
        let windows = prompt_windows(&segs, 3, 0);
        let spans: Vec<(u32, u32)> = windows.iter().map(|w| (w.first_seq(), w.last_seq())).collect();
        assert_eq!(spans, vec![(1, 3), (4, 6), (7, 7)]);
        assert!(windows[0].is_first && !windows[0].is_last);
        assert!(!windows[1].is_first && !windows[1].is_last);
        assert!(windows[2].is_last);
    }

    #[test]
    fn test_prompt_windows_with_overlap() {
        let segs = segments(7);
        let spans: Vec<(u32, u32)> = prompt_windows(&segs, 3, 1)
            .iter()
            .map(|w| (w.first_seq(), w.last_seq()))
            .collect();
        assert_eq!(spans, vec![(1, 3), (3, 5), (5, 7)]);
    }

    #[test]
    fn test_single_window_carries_both_markers() {
        let segs = segments(2);
        let windows = prompt_windows(&segs, 30, 0);
        assert_eq!(windows.len(), 1);
        let text = windows[0].render(false);
        assert!(text.starts_with(prompt::TRANSCRIPT_START));
        assert!(text.ends_with(prompt::TRANSCRIPT_END));
        assert!(prompt_windows(&[], 30, 0).is_empty());
    }

    #[test]
    fn test_map_predictions_nearest_start() {
        let segs = segments(6); // starts 0,5,10,15,20,25
        let found = map_predictions(
            &segs,
            &[
                prediction(10.0, 0.9),
                prediction(15.4, 0.95),
                prediction(12.5, 0.99),
                prediction(200.0, 0.99),
                prediction(20.0, 0.5),
            ],
            0.8,
        );
        let seqs: Vec<u32> = found.iter().map(|i| i.sequence_num).collect();
        // 12.5 is inside segment 3 even though no start is within tolerance.
        assert_eq!(seqs, vec![3, 4, 3]);
    }

    #[test]
    fn test_map_predictions_falls_back_to_containing_segment() {
        let segs = segments(5); // starts 0,5,10,15,20
        // Nearest start is 15, two seconds away; segment 3 spans 10..15.
        let found = map_predictions(&segs, &[prediction(13.0, 0.9)], 0.8);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sequence_num, 3);
        assert_eq!((found[0].start_time, found[0].end_time), (10.0, 15.0));
    }

    #[test]
    fn test_group_identified_consecutive_runs() {
        let ids: Vec<Identification> = [(3, 0.9), (4, 0.95), (5, 0.85), (9, 0.8), (10, 0.99)]
            .into_iter()
            .map(|(seq, confidence)| Identification {
                sequence_num: seq,
                start_time: (seq - 1) as f64 * 5.0,
                end_time: seq as f64 * 5.0,
                confidence,
            })
            .collect();
        let groups = group_identified(&ids);
        assert_eq!(groups.len(), 2);
        assert_eq!((groups[0].start, groups[0].end), (10.0, 25.0));
        assert_eq!(groups[0].confidence, 0.95);
        assert_eq!((groups[1].first_seq, groups[1].last_seq), (9, 10));
        assert_eq!(groups[1].confidence, 0.99);
    }

    /// Flags every line mentioning Acme in detection prompts; refuses to refine.
    fn acme_model() -> ScriptedModel {
        ScriptedModel::new(|request| {
            if request.system.starts_with("You refine") {
                return Ok("no idea".to_string());
            }
            let ads: Vec<String> = request
                .prompt
                .lines()
                .filter(|line| line.contains("Acme"))
                .filter_map(|line| {
                    let start = line.strip_prefix('[')?.split(']').next()?;
                    Some(format!(r#"{{"segment_offset": {start}, "confidence": 0.93}}"#))
                })
                .collect();
            Ok(format!(
                r#"{{"ad_segments": [{}], "content_type": "external_promo", "confidence": 0.9}}"#,
                ads.join(", ")
            ))
        })
    }

    fn acme_episode() -> Vec<TranscriptSegment> {
        (1..=12)
            .map(|i| {
                let text = match i {
                    5 => "This episode is brought to you by Acme.",
                    6 => "Acme makes everything.",
                    7 => "Visit acme.com, that's Acme dot com.",
                    _ => "Just the two of us talking.",
                };
                seg(i, (i - 1) as f64 * 10.0, i as f64 * 10.0, text)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_detect_ads_end_to_end() {
        let mut harness = Harness::new(acme_model());
        harness.detection.segments_per_prompt = 5;
        harness.detection.window_overlap = 1;
        let segs = acme_episode();

        let outcome = detect_ads(&harness.ctx(), &segs).await.unwrap();

        let seqs: Vec<u32> = outcome.identifications.iter().map(|i| i.sequence_num).collect();
        assert_eq!(seqs, vec![5, 6, 7]);
        assert_eq!(outcome.coarse.len(), 1);
        assert_eq!((outcome.coarse[0].start, outcome.coarse[0].end), (40.0, 70.0));
        // Refinement output was unusable, heuristic found nothing beyond the ad.
        assert_eq!(outcome.raw_intervals(), vec![(40.0, 70.0)]);
        assert_eq!(outcome.content_type.unwrap().content_type, "external_promo");

        // Windows 1-5, 5-9, 9-12, then one refinement call.
        assert_eq!(harness.model.calls(), 4);
        let requests = harness.model.requests();
        assert!(requests.iter().all(|r| r.model == "test-model"));
        assert!(requests[3].system.starts_with("You refine"));
        let model_calls = harness
            .records
            .commands()
            .iter()
            .filter(|c| matches!(c, RecordCommand::ModelCall(_)))
            .count();
        assert_eq!(model_calls, 4);
    }

    #[tokio::test]
    async fn test_detect_ads_without_refinement() {
        let mut harness = Harness::new(acme_model());
        harness.detection.refine_boundaries = false;
        let segs = acme_episode();

        let outcome = detect_ads(&harness.ctx(), &segs).await.unwrap();
        assert_eq!(outcome.boundaries[0].start_reason, "coarse");
        assert_eq!(harness.model.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_ads_is_not_an_error() {
        let harness = Harness::replying(r#"{"ad_segments": []}"#);
        let outcome = detect_ads(&harness.ctx(), &segments(4)).await.unwrap();
        assert!(outcome.identifications.is_empty());
        assert!(outcome.raw_intervals().is_empty());
        assert!(outcome.content_type.is_none());
    }

    #[tokio::test]
    async fn test_malformed_output_reissued_then_surfaced() {
        let harness = Harness::replying(r#"{"ad_segments": uhoh..."#);
        let err = detect_ads(&harness.ctx(), &segments(4)).await.unwrap_err();
        assert!(matches!(err, CallError::Malformed(_)));
        assert_eq!(harness.model.calls(), MAX_PARSE_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_fatal_call_error_propagates() {
        let harness = Harness::new(ScriptedModel::new(|_| Err(CallError::status(401, "bad key"))));
        let err = detect_ads(&harness.ctx(), &segments(4)).await.unwrap_err();
        assert!(matches!(err, CallError::Fatal { .. }));
        assert_eq!(harness.model.calls(), 1);

        let records = harness.records.commands();
        match &records[0] {
            RecordCommand::ModelCall(record) => {
                assert_eq!(record.status, CallStatus::Failed);
                assert!(record.error.as_deref().unwrap_or("").contains("401"));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_detection_keeps_coarse_bounds() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        let mut harness = Harness::new(ScriptedModel::new(move |_| {
            trip.cancel();
            Ok(r#"{"ad_segments": [{"segment_offset": 40.0, "confidence": 0.95}]}"#.to_string())
        }));
        harness.cancel = cancel;

        let outcome = detect_ads(&harness.ctx(), &acme_episode()).await.unwrap();
        assert_eq!(outcome.raw_intervals(), vec![(40.0, 50.0)]);
        assert_eq!(outcome.boundaries[0].start_reason, "coarse");
        // No refinement call after the cancel.
        assert_eq!(harness.model.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_window() {
        let harness = Harness::replying(r#"{"ad_segments": []}"#);
        harness.cancel.cancel();
        let err = detect_ads(&harness.ctx(), &segments(4)).await.unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
        assert_eq!(harness.model.calls(), 0);
    }
}
