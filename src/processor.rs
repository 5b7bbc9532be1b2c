//! Episode processing pipeline.
//!
//! A job runs detection (model-driven or chapter-driven), merges the detected
//! intervals under the job's removal policy, cuts them from the audio and
//! rewrites the surviving chapters. Progress and persistence go through two
//! narrow collaborator traits; the processor owns none of that state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chapters::{self, Chapter, ChapterAdDetector};
use crate::config::{validate_policy, AdTrimConfig};
use crate::error::{CallError, ChapterError, MediaError, MediaResult, ProcessError, ProcessResult};
use crate::ffmpeg::{self, MediaTools};
use crate::llm::{ConcurrencyLimiter, LanguageModel, RetryPolicy};
use crate::segments::{removed_ms, AdInterval, RemovalPolicy};
use crate::transcription::analysis::{self, DetectionContext, Identification};
use crate::transcription::{ContentTypeHint, TranscriptSegment};

/// Receives progress and terminal failure for a job.
pub trait StatusSink: Send + Sync {
    fn report_progress(&self, job_id: &str, step: &str, percentage: f64);
    fn report_failure(&self, job_id: &str, reason: &str);
}

/// Receives every persistence request the pipeline makes.
pub trait RecordSink: Send + Sync {
    fn submit(&self, command: RecordCommand) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Failed,
}

/// One model call, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCallRecord {
    pub job_id: String,
    pub model: String,
    pub first_seq: u32,
    pub last_seq: u32,
    pub prompt: String,
    pub response: Option<String>,
    pub status: CallStatus,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RecordCommand {
    ModelCall(ModelCallRecord),
    Identifications {
        job_id: String,
        identifications: Vec<Identification>,
        content_type: Option<ContentTypeHint>,
    },
    AudioProcessed {
        job_id: String,
        intervals: Vec<AdInterval>,
        output_path: PathBuf,
        content_type: Option<ContentTypeHint>,
    },
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecordSink;

impl RecordSink for NullRecordSink {
    fn submit(&self, _command: RecordCommand) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps submitted commands in memory, in order.
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    commands: Mutex<Vec<RecordCommand>>,
}

impl MemoryRecordSink {
    pub fn commands(&self) -> Vec<RecordCommand> {
        lock(&self.commands).clone()
    }
}

impl RecordSink for MemoryRecordSink {
    fn submit(&self, command: RecordCommand) -> anyhow::Result<()> {
        lock(&self.commands).push(command);
        Ok(())
    }
}

/// Lock, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub step: String,
    pub progress: f64,
    pub status: JobStatus,
}

#[derive(Debug)]
struct JobEntry {
    progress: Progress,
    result: Option<ProcessingResult>,
    /// Intervals from a job that failed or was cancelled after detection, kept
    /// for `Processor::apply_edit`.
    detected: Option<Vec<AdInterval>>,
    cancel: CancellationToken,
}

/// In-memory job table: progress, results and cancellation per job id.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new job and hand back its cancellation token.
    pub fn register(&self, job_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        lock(&self.jobs).insert(
            job_id.to_string(),
            JobEntry {
                progress: Progress {
                    step: "queued".to_string(),
                    progress: 0.0,
                    status: JobStatus::Running,
                },
                result: None,
                detected: None,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn progress(&self, job_id: &str) -> Option<Progress> {
        lock(&self.jobs).get(job_id).map(|job| job.progress.clone())
    }

    pub fn result(&self, job_id: &str) -> Option<ProcessingResult> {
        lock(&self.jobs).get(job_id).and_then(|job| job.result.clone())
    }

    pub fn detected_intervals(&self, job_id: &str) -> Option<Vec<AdInterval>> {
        lock(&self.jobs).get(job_id).and_then(|job| job.detected.clone())
    }

    /// Request cancellation. Returns false for unknown or finished jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        match lock(&self.jobs).get(job_id) {
            Some(job) if !job.progress.status.is_terminal() => {
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn complete(&self, job_id: &str, result: ProcessingResult) {
        if let Some(job) = lock(&self.jobs).get_mut(job_id) {
            job.progress.step = "done".to_string();
            job.progress.progress = 100.0;
            job.progress.status = JobStatus::Completed;
            job.result = Some(result);
        }
    }

    pub fn fail(&self, job_id: &str, error: &ProcessError) {
        if let Some(job) = lock(&self.jobs).get_mut(job_id) {
            job.progress.status = match error {
                ProcessError::Cancelled { .. } => JobStatus::Cancelled,
                other => JobStatus::Failed {
                    reason: other.to_string(),
                },
            };
            job.detected = error.detected_intervals().map(<[AdInterval]>::to_vec);
        }
    }
}

impl StatusSink for JobRegistry {
    fn report_progress(&self, job_id: &str, step: &str, percentage: f64) {
        if let Some(job) = lock(&self.jobs).get_mut(job_id) {
            if job.progress.status.is_terminal() {
                return;
            }
            job.progress.step = step.to_string();
            job.progress.progress = percentage.clamp(0.0, 100.0);
        }
    }

    fn report_failure(&self, job_id: &str, reason: &str) {
        if let Some(job) = lock(&self.jobs).get_mut(job_id) {
            if job.progress.status == JobStatus::Completed {
                return;
            }
            job.progress.status = JobStatus::Failed {
                reason: reason.to_string(),
            };
        }
    }
}

/// How ad intervals are found for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// Ask a language model; `None` uses the configured model.
    Model { model: Option<String> },
    /// Use chapters whose titles match a filter string. On a file without
    /// chapters, fall back to `fallback_model` if given.
    Chapters {
        filter_strings: Vec<String>,
        fallback_model: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeJob {
    pub audio_path: PathBuf,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default)]
    pub policy: RemovalPolicy,
    pub strategy: DetectionStrategy,
    /// Defaults to the input path with the configured suffix.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedBy {
    Model,
    Chapters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub output_path: PathBuf,
    pub intervals: Vec<AdInterval>,
    /// Adjusted chapters written to the output; empty when the source had none.
    pub chapters: Vec<Chapter>,
    pub content_type: Option<ContentTypeHint>,
    pub detected_by: DetectedBy,
    pub original_duration_ms: u64,
    pub final_duration_ms: u64,
    pub removed_ms: u64,
}

/// Intervals plus the chapters that survive them, before any editing.
#[derive(Debug, Clone)]
struct Detected {
    intervals: Vec<AdInterval>,
    chapters_kept: Vec<Chapter>,
    content_type: Option<ContentTypeHint>,
    detected_by: DetectedBy,
}

pub struct Processor {
    config: AdTrimConfig,
    model: Arc<dyn LanguageModel>,
    limiter: Arc<ConcurrencyLimiter>,
    retry: RetryPolicy,
    tools: MediaTools,
    records: Arc<dyn RecordSink>,
    status: Arc<dyn StatusSink>,
}

impl Processor {
    /// `limiter` is shared by every processor in the process so the call cap
    /// holds across jobs.
    pub fn new(
        config: AdTrimConfig,
        model: Arc<dyn LanguageModel>,
        limiter: Arc<ConcurrencyLimiter>,
        records: Arc<dyn RecordSink>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let retry = RetryPolicy::from(&config.llm);
        let tools = MediaTools::new(&config.media);
        Self {
            config,
            model,
            limiter,
            retry,
            tools,
            records,
            status,
        }
    }

    pub fn config(&self) -> &AdTrimConfig {
        &self.config
    }

    pub fn tools(&self) -> &MediaTools {
        &self.tools
    }

    /// Spawn `job` on the runtime, tracked by `registry`. Returns the job id.
    pub fn start(self: &Arc<Self>, registry: &JobRegistry, job: EpisodeJob) -> String {
        let job_id = Uuid::new_v4().to_string();
        let cancel = registry.register(&job_id);

        let processor = Arc::clone(self);
        let registry = registry.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            match processor.process(&id, &job, &cancel).await {
                Ok(result) => registry.complete(&id, result),
                Err(e) => registry.fail(&id, &e),
            }
        });

        job_id
    }

    /// Run one job to completion. Cancellation is honoured between stages; an
    /// ffmpeg invocation that has started always runs to the end.
    pub async fn process(
        &self,
        job_id: &str,
        job: &EpisodeJob,
        cancel: &CancellationToken,
    ) -> ProcessResult<ProcessingResult> {
        let outcome = self.run(job_id, job, cancel).await;
        match &outcome {
            Ok(result) => {
                info!(
                    job_id,
                    intervals = result.intervals.len(),
                    removed_ms = result.removed_ms,
                    output = %result.output_path.display(),
                    "Job complete"
                );
                self.status.report_progress(job_id, "done", 100.0);
            }
            Err(ProcessError::Cancelled { stage, .. }) => {
                info!(job_id, stage = %stage, "Job cancelled");
                self.status.report_failure(job_id, "cancelled");
            }
            Err(e) => {
                error!(job_id, "Job failed: {}", e);
                self.status.report_failure(job_id, &e.to_string());
            }
        }
        outcome
    }

    async fn run(
        &self,
        job_id: &str,
        job: &EpisodeJob,
        cancel: &CancellationToken,
    ) -> ProcessResult<ProcessingResult> {
        validate_policy(&job.policy).map_err(|e| ProcessError::InvalidJob(e.to_string()))?;
        let output_path = self.output_path_for(job)?;

        checkpoint(cancel, "detection")?;
        self.status.report_progress(job_id, "detecting", 5.0);

        let detected = match &job.strategy {
            DetectionStrategy::Model { model } => {
                self.detect_with_model(job_id, job, model.as_deref(), cancel).await?
            }
            DetectionStrategy::Chapters {
                filter_strings,
                fallback_model,
            } => match self.detect_with_chapters(job, filter_strings).await {
                Err(ProcessError::Chapters(ChapterError::NoChapters(path)))
                    if fallback_model.is_some() =>
                {
                    info!(
                        job_id,
                        path = %path.display(),
                        "No chapters found, falling back to model detection"
                    );
                    self.detect_with_model(job_id, job, fallback_model.as_deref(), cancel)
                        .await?
                }
                other => other?,
            },
        };

        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled {
                stage: "audio edit".to_string(),
                detected: detected.intervals,
            });
        }
        self.edit(job_id, job, &output_path, detected).await
    }

    fn output_path_for(&self, job: &EpisodeJob) -> ProcessResult<PathBuf> {
        let output = job.output_path.clone().unwrap_or_else(|| {
            ffmpeg::generate_output_path(&job.audio_path, &self.config.media.output_suffix)
        });
        if output == job.audio_path {
            return Err(ProcessError::InvalidJob(
                "output path must differ from the input audio".to_string(),
            ));
        }
        Ok(output)
    }

    async fn detect_with_model(
        &self,
        job_id: &str,
        job: &EpisodeJob,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> ProcessResult<Detected> {
        let model_name = model.unwrap_or(self.config.llm.model.as_str());
        let ctx = DetectionContext {
            job_id,
            model_name,
            model: self.model.as_ref(),
            limiter: self.limiter.as_ref(),
            retry: &self.retry,
            llm: &self.config.llm,
            detection: &self.config.detection,
            records: self.records.as_ref(),
            cancel,
        };

        // Unreadable audio fails the job before any model call.
        let duration_ms = self.probe_duration(&job.audio_path).await?;

        let outcome = match analysis::detect_ads(&ctx, &job.segments).await {
            Ok(outcome) => outcome,
            Err(CallError::Cancelled) => return Err(ProcessError::cancelled("detection")),
            Err(e) => return Err(e.into()),
        };

        self.status.report_progress(job_id, "merging", 50.0);
        let intervals = job.policy.merge(duration_ms, &outcome.raw_intervals());
        info!(
            job_id,
            coarse = outcome.coarse.len(),
            merged = intervals.len(),
            removed_ms = removed_ms(&intervals),
            "Merged ad intervals"
        );

        let chapters = match self.read_chapters(&job.audio_path).await {
            Ok(chapters) => chapters,
            Err(e) => {
                warn!(job_id, "Could not read chapters, output will have none: {}", e);
                Vec::new()
            }
        };
        let (chapters_kept, dropped) = chapters::drop_removed(&chapters, &intervals);
        if !dropped.is_empty() {
            info!(job_id, dropped = dropped.len(), "Dropping chapters inside removed audio");
        }

        Ok(Detected {
            intervals,
            chapters_kept,
            content_type: outcome.content_type,
            detected_by: DetectedBy::Model,
        })
    }

    async fn detect_with_chapters(
        &self,
        job: &EpisodeJob,
        filter_strings: &[String],
    ) -> ProcessResult<Detected> {
        let detector = ChapterAdDetector::new(filter_strings);
        let tools = self.tools.clone();
        let audio_path = job.audio_path.clone();
        let detection = tokio::task::spawn_blocking(move || detector.detect(&tools, &audio_path))
            .await
            .map_err(join_error)
            .map_err(ChapterError::from)??;

        let duration_ms = self.probe_duration(&job.audio_path).await?;
        Ok(Detected {
            intervals: clamp_to_duration(detection.ad_intervals, duration_ms),
            chapters_kept: detection.chapters_kept,
            content_type: None,
            detected_by: DetectedBy::Chapters,
        })
    }

    async fn edit(
        &self,
        job_id: &str,
        job: &EpisodeJob,
        output_path: &Path,
        detected: Detected,
    ) -> ProcessResult<ProcessingResult> {
        let Detected {
            intervals,
            chapters_kept,
            content_type,
            detected_by,
        } = detected;

        self.status.report_progress(job_id, "editing", 60.0);
        let (plan, chapters) = match self
            .cut_and_rechapter(
                job_id,
                &job.audio_path,
                &intervals,
                job.policy.fade_ms,
                output_path,
                &chapters_kept,
            )
            .await
        {
            Ok(done) => done,
            Err(source) => return Err(ProcessError::AudioEdit { intervals, source }),
        };

        let command = RecordCommand::AudioProcessed {
            job_id: job_id.to_string(),
            intervals: intervals.clone(),
            output_path: output_path.to_path_buf(),
            content_type: content_type.clone(),
        };
        if let Err(e) = self.records.submit(command) {
            warn!(job_id, "Failed to submit record: {:#}", e);
        }

        Ok(ProcessingResult {
            output_path: output_path.to_path_buf(),
            removed_ms: removed_ms(&intervals),
            intervals,
            chapters,
            content_type,
            detected_by,
            original_duration_ms: plan.source_duration_ms,
            final_duration_ms: plan.output_duration_ms(),
        })
    }

    /// Re-run only the edit stage from intervals detected earlier, e.g. after
    /// an `AudioEdit` failure.
    pub async fn apply_edit(
        &self,
        job_id: &str,
        job: &EpisodeJob,
        intervals: Vec<AdInterval>,
    ) -> ProcessResult<ProcessingResult> {
        let output_path = self.output_path_for(job)?;
        let chapters = match self.read_chapters(&job.audio_path).await {
            Ok(chapters) => chapters,
            Err(e) => {
                warn!(job_id, "Could not read chapters, output will have none: {}", e);
                Vec::new()
            }
        };
        let (chapters_kept, _) = chapters::drop_removed(&chapters, &intervals);
        let detected_by = match job.strategy {
            DetectionStrategy::Model { .. } => DetectedBy::Model,
            DetectionStrategy::Chapters { .. } => DetectedBy::Chapters,
        };
        let outcome = self
            .edit(
                job_id,
                job,
                &output_path,
                Detected {
                    intervals,
                    chapters_kept,
                    content_type: None,
                    detected_by,
                },
            )
            .await;
        if let Err(e) = &outcome {
            self.status.report_failure(job_id, &e.to_string());
        }
        outcome
    }

    async fn cut_and_rechapter(
        &self,
        job_id: &str,
        source: &Path,
        intervals: &[AdInterval],
        fade_ms: u64,
        output: &Path,
        chapters_kept: &[Chapter],
    ) -> MediaResult<(ffmpeg::EditPlan, Vec<Chapter>)> {
        let work_dir = self
            .config
            .media
            .work_dir
            .join(format!("job_{}_{}", job_id, Uuid::new_v4()));

        let tools = self.tools.clone();
        let plan = {
            let (source, intervals, output, job_dir) = (
                source.to_path_buf(),
                intervals.to_vec(),
                output.to_path_buf(),
                work_dir.clone(),
            );
            let rendered = tokio::task::spawn_blocking(move || {
                tools.cut_and_fade(&source, &intervals, fade_ms, &output, &job_dir)
            })
            .await
            .map_err(join_error);
            if let Err(e) = std::fs::remove_dir_all(&work_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id, dir = %work_dir.display(), "Failed to clean work dir: {}", e);
                }
            }
            rendered??
        };

        if chapters_kept.is_empty() {
            return Ok((plan, Vec::new()));
        }

        self.status.report_progress(job_id, "writing_chapters", 90.0);
        let adjusted = chapters::recalculate(chapters_kept, intervals);
        let tools = self.tools.clone();
        let (output, to_write) = (output.to_path_buf(), adjusted.clone());
        tokio::task::spawn_blocking(move || tools.write_chapters(&output, &to_write))
            .await
            .map_err(join_error)??;

        Ok((plan, adjusted))
    }

    async fn probe_duration(&self, path: &Path) -> MediaResult<u64> {
        let tools = self.tools.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || tools.probe_duration_ms(&path))
            .await
            .map_err(join_error)?
    }

    async fn read_chapters(&self, path: &Path) -> MediaResult<Vec<Chapter>> {
        let tools = self.tools.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || tools.read_chapters(&path))
            .await
            .map_err(join_error)?
    }
}

fn checkpoint(cancel: &CancellationToken, stage: &str) -> ProcessResult<()> {
    if cancel.is_cancelled() {
        return Err(ProcessError::cancelled(stage));
    }
    Ok(())
}

fn join_error(e: tokio::task::JoinError) -> MediaError {
    MediaError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// Chapter end times can overshoot the probed duration by rounding.
fn clamp_to_duration(intervals: Vec<AdInterval>, duration_ms: u64) -> Vec<AdInterval> {
    intervals
        .into_iter()
        .filter_map(|iv| {
            let end = iv.end_ms.min(duration_ms);
            (iv.start_ms < end).then(|| AdInterval::new(iv.start_ms, end))
        })
        .collect()
}
