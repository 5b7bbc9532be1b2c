//! Runtime configuration.
//!
//! Every tunable has a named default resolved at construction. Values can be
//! loaded from a JSON file, overlaid from `ADTRIM_*` environment variables, or
//! both.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::llm::LlmProvider;
use crate::segments::RemovalPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdTrimConfig {
    pub llm: LlmConfig,
    pub detection: DetectionConfig,
    pub policy: RemovalPolicy,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    /// Never serialized back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    pub max_concurrent_calls: usize,
    #[serde(with = "duration_secs")]
    pub slot_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            model: "claude-sonnet-4-5-20250929".to_string(),
            api_key: None,
            base_url: None,
            request_timeout: Duration::from_secs(120),
            max_attempts: 3,
            max_backoff: Duration::from_secs(60),
            max_concurrent_calls: 3,
            slot_timeout: Duration::from_secs(300),
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Transcript segments per model prompt.
    pub segments_per_prompt: usize,
    /// Segments repeated from the previous window at the start of the next.
    pub window_overlap: usize,
    /// Predictions below this confidence are ignored.
    pub min_confidence: f64,
    pub use_cue_highlighting: bool,
    pub refine_boundaries: bool,
    /// Segments of context on each side of a candidate sent for refinement.
    pub refinement_context_segments: usize,
    pub max_start_extension_sec: f64,
    pub max_end_extension_sec: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            segments_per_prompt: 30,
            window_overlap: 0,
            min_confidence: 0.8,
            use_cue_highlighting: true,
            refine_boundaries: true,
            refinement_context_segments: 8,
            max_start_extension_sec: 30.0,
            max_end_extension_sec: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Parent of per-job scratch directories.
    pub work_dir: PathBuf,
    /// Appended to the input file stem when no output path is given.
    pub output_suffix: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            work_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("adtrim"),
            output_suffix: "_adfree".to_string(),
        }
    }
}

impl AdTrimConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AdTrimConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup`, typically `std::env::var`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup("ADTRIM_LLM_PROVIDER") {
            self.llm.provider = LlmProvider::from_str(&provider);
        }
        if let Some(model) = lookup("ADTRIM_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = lookup("ADTRIM_LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        set_parsed(&lookup, "ADTRIM_LLM_MAX_ATTEMPTS", &mut self.llm.max_attempts)?;
        set_parsed(
            &lookup,
            "ADTRIM_LLM_MAX_CONCURRENT_CALLS",
            &mut self.llm.max_concurrent_calls,
        )?;
        set_parsed(&lookup, "ADTRIM_LLM_MAX_TOKENS", &mut self.llm.max_tokens)?;
        set_secs(&lookup, "ADTRIM_LLM_TIMEOUT_SECS", &mut self.llm.request_timeout)?;
        set_secs(&lookup, "ADTRIM_LLM_SLOT_TIMEOUT_SECS", &mut self.llm.slot_timeout)?;
        set_secs(&lookup, "ADTRIM_LLM_MAX_BACKOFF_SECS", &mut self.llm.max_backoff)?;

        set_parsed(
            &lookup,
            "ADTRIM_SEGMENTS_PER_PROMPT",
            &mut self.detection.segments_per_prompt,
        )?;
        set_parsed(&lookup, "ADTRIM_WINDOW_OVERLAP", &mut self.detection.window_overlap)?;
        set_parsed(&lookup, "ADTRIM_MIN_CONFIDENCE", &mut self.detection.min_confidence)?;
        set_parsed(
            &lookup,
            "ADTRIM_USE_CUE_HIGHLIGHTING",
            &mut self.detection.use_cue_highlighting,
        )?;
        set_parsed(
            &lookup,
            "ADTRIM_REFINE_BOUNDARIES",
            &mut self.detection.refine_boundaries,
        )?;

        set_parsed(
            &lookup,
            "ADTRIM_MIN_SEGMENT_LENGTH_SEC",
            &mut self.policy.min_segment_length_sec,
        )?;
        set_parsed(
            &lookup,
            "ADTRIM_MIN_SEPARATION_SEC",
            &mut self.policy.min_separation_sec,
        )?;
        set_parsed(&lookup, "ADTRIM_FADE_MS", &mut self.policy.fade_ms)?;

        if let Some(bin) = lookup("ADTRIM_FFMPEG") {
            self.media.ffmpeg_bin = PathBuf::from(bin);
        }
        if let Some(bin) = lookup("ADTRIM_FFPROBE") {
            self.media.ffprobe_bin = PathBuf::from(bin);
        }
        if let Some(dir) = lookup("ADTRIM_WORK_DIR") {
            self.media.work_dir = PathBuf::from(dir);
        }

        if self.llm.api_key.is_none() {
            self.llm.api_key = lookup(self.llm.provider.api_key_name())
                .map(|key| key.trim().trim_matches('"').to_string())
                .filter(|key| !key.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.max_concurrent_calls == 0 {
            return Err(ConfigError::invalid("llm.max_concurrent_calls must be > 0"));
        }
        if self.llm.max_attempts == 0 {
            return Err(ConfigError::invalid("llm.max_attempts must be > 0"));
        }
        if self.detection.segments_per_prompt == 0 {
            return Err(ConfigError::invalid(
                "detection.segments_per_prompt must be > 0",
            ));
        }
        if self.detection.window_overlap >= self.detection.segments_per_prompt {
            return Err(ConfigError::invalid(
                "detection.window_overlap must be smaller than segments_per_prompt",
            ));
        }
        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return Err(ConfigError::invalid(
                "detection.min_confidence must be within [0, 1]",
            ));
        }
        if self.detection.max_start_extension_sec < 0.0
            || self.detection.max_end_extension_sec < 0.0
        {
            return Err(ConfigError::invalid("extension caps must be non-negative"));
        }
        validate_policy(&self.policy)
    }
}

pub fn validate_policy(policy: &RemovalPolicy) -> Result<(), ConfigError> {
    if !(policy.min_segment_length_sec >= 0.0) || !(policy.min_separation_sec >= 0.0) {
        return Err(ConfigError::invalid(
            "removal policy lengths must be non-negative",
        ));
    }
    Ok(())
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(format!("{key}: cannot parse {raw:?}")))?;
    }
    Ok(())
}

fn set_secs<F>(lookup: &F, key: &str, target: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = target.as_secs_f64();
    set_parsed(lookup, key, &mut secs)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::invalid(format!("{key} must be a non-negative number")));
    }
    *target = Duration::from_secs_f64(secs);
    Ok(())
}

/// Durations as (fractional) seconds in config files.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
