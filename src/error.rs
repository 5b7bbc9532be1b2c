//! Error types for detection, model calls, chapters and media editing.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::llm::classify::ErrorCategory;
use crate::segments::AdInterval;

pub type CallResult<T> = Result<T, CallError>;
pub type MediaResult<T> = Result<T, MediaError>;
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Model text that could not be turned into structured output.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("model output contains no JSON object")]
    NoJsonObject,

    /// `source` is always the error from the direct parse, never the repair attempt.
    #[error("malformed model output: {source}")]
    MalformedOutput {
        #[source]
        source: serde_json::Error,
        repair: Option<String>,
    },
}

/// Why the best-effort repair of truncated model output did not produce a value.
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("output is balanced, nothing to repair")]
    Balanced,

    #[error("repaired output still malformed: {source}")]
    StillMalformed {
        repaired: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of a single language-model call, before or after retries.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("could not obtain a model call slot within {waited:?}")]
    SlotUnavailable { waited: Duration },

    #[error("model call timed out after {0:?}")]
    Deadline(Duration),

    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model response contained no text")]
    EmptyResponse,

    #[error("{category} error after {attempts} attempt(s): {message}")]
    Transient {
        category: ErrorCategory,
        attempts: u32,
        message: String,
    },

    #[error("{category} error, not retried: {message}")]
    Fatal {
        category: ErrorCategory,
        message: String,
    },

    #[error(transparent)]
    Malformed(#[from] ParseError),

    #[error("model call cancelled")]
    Cancelled,
}

impl CallError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }
}

/// Errors from ffmpeg/ffprobe invocations and edit planning.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ChapterError {
    #[error("no chapter metadata in {}", .0.display())]
    NoChapters(PathBuf),

    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Job-level failure surfaced to the caller.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// `detected` holds intervals found before the cancellation took effect.
    #[error("job cancelled before {stage}")]
    Cancelled {
        stage: String,
        detected: Vec<AdInterval>,
    },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("ad detection failed: {0}")]
    Detection(#[from] CallError),

    #[error("chapter detection failed: {0}")]
    Chapters(#[from] ChapterError),

    /// The detected intervals survive so the edit can be retried without re-detection.
    #[error("audio edit failed after detecting {} ad interval(s): {source}", .intervals.len())]
    AudioEdit {
        intervals: Vec<AdInterval>,
        #[source]
        source: MediaError,
    },

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
            detected: Vec::new(),
        }
    }

    /// Intervals already computed when the job failed, if the failure happened after detection.
    pub fn detected_intervals(&self) -> Option<&[AdInterval]> {
        match self {
            ProcessError::AudioEdit { intervals, .. } => Some(intervals),
            ProcessError::Cancelled { detected, .. } if !detected.is_empty() => Some(detected),
            _ => None,
        }
    }
}
