//! Detect advertisements in transcribed podcast episodes and cut them from the
//! audio, keeping chapter metadata consistent with the edited file.

pub mod chapters;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod llm;
pub mod logging;
pub mod processor;
pub mod segments;
pub mod transcription;

pub use chapters::{Chapter, ChapterAdDetector, ChapterDetection};
pub use config::{AdTrimConfig, DetectionConfig, LlmConfig, MediaConfig};
pub use error::{CallError, ChapterError, MediaError, ParseError, ProcessError};
pub use ffmpeg::{plan_edit, EditPlan, MediaTools};
pub use llm::{ConcurrencyLimiter, HttpLanguageModel, LanguageModel, LlmProvider};
pub use processor::{
    DetectionStrategy, EpisodeJob, JobRegistry, ProcessingResult, Processor, RecordCommand,
    RecordSink, StatusSink,
};
pub use segments::{AdInterval, RemovalPolicy};
pub use transcription::{AdPrediction, AdPredictionList, ContentTypeHint, TranscriptSegment};
