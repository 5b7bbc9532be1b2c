//! Run one ad-removal job from the command line and print the result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use adtrim::config::AdTrimConfig;
use adtrim::llm::{ConcurrencyLimiter, HttpLanguageModel};
use adtrim::logging::{self, LogFormat};
use adtrim::processor::{DetectionStrategy, EpisodeJob, JobRegistry, NullRecordSink, Processor};
use adtrim::transcription::load_transcript;

#[derive(Parser, Debug)]
#[command(name = "adtrim")]
#[command(about = "Detect ads in a podcast episode and cut them from the audio")]
struct Params {
    /// Source audio file.
    #[arg(short = 'a', long = "audio")]
    audio_path: PathBuf,

    /// Transcript JSON: an array of segments or `{"segments": [...]}`.
    #[arg(short = 't', long = "transcript")]
    transcript_path: Option<PathBuf>,

    /// Detect ads from chapter titles containing any of these strings.
    #[arg(short = 'c', long = "chapter-filter", value_delimiter = ',')]
    chapter_filters: Vec<String>,

    /// With --chapter-filter, use the model when the file has no chapters.
    #[arg(long = "fallback-to-model", default_value_t = false)]
    fallback_to_model: bool,

    /// Model identifier; defaults to the configured one.
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// JSON config file, overlaid by ADTRIM_* environment variables.
    #[arg(long = "config")]
    config_path: Option<PathBuf>,

    #[arg(short = 'o', long = "output")]
    output_path: Option<PathBuf>,

    #[arg(long = "min-length")]
    min_segment_length_sec: Option<f64>,

    #[arg(long = "min-separation")]
    min_separation_sec: Option<f64>,

    #[arg(long = "fade-ms")]
    fade_ms: Option<u64>,
}

fn load_config(params: &Params) -> Result<AdTrimConfig> {
    dotenvy::dotenv().ok();
    let mut config = match &params.config_path {
        Some(path) => AdTrimConfig::from_file(path)?,
        None => AdTrimConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;

    if let Some(v) = params.min_segment_length_sec {
        config.policy.min_segment_length_sec = v;
    }
    if let Some(v) = params.min_separation_sec {
        config.policy.min_separation_sec = v;
    }
    if let Some(v) = params.fade_ms {
        config.policy.fade_ms = v;
    }
    config.validate()?;
    Ok(config)
}

fn build_job(params: &Params, config: &AdTrimConfig) -> Result<EpisodeJob> {
    let strategy = if params.chapter_filters.is_empty() {
        DetectionStrategy::Model {
            model: params.model.clone(),
        }
    } else {
        DetectionStrategy::Chapters {
            filter_strings: params.chapter_filters.clone(),
            fallback_model: params
                .fallback_to_model
                .then(|| params.model.clone().unwrap_or_else(|| config.llm.model.clone())),
        }
    };

    let needs_transcript = matches!(strategy, DetectionStrategy::Model { .. })
        || params.fallback_to_model;
    let segments = match &params.transcript_path {
        Some(path) => load_transcript(path)?,
        None if needs_transcript => bail!("--transcript is required for model detection"),
        None => Vec::new(),
    };

    Ok(EpisodeJob {
        audio_path: params.audio_path.clone(),
        segments,
        policy: config.policy,
        strategy,
        output_path: params.output_path.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(LogFormat::from_env());
    let params = Params::parse();

    let config = load_config(&params)?;
    let job = build_job(&params, &config)?;

    if !matches!(job.strategy, DetectionStrategy::Chapters { fallback_model: None, .. })
        && config.llm.api_key.is_none()
    {
        warn!(
            key = config.llm.provider.api_key_name(),
            "No API key configured, model calls will be rejected"
        );
    }

    let model = HttpLanguageModel::new(&config.llm).context("Failed to build model client")?;
    let limiter = ConcurrencyLimiter::new(config.llm.max_concurrent_calls)?;
    let registry = JobRegistry::new();
    let processor = Processor::new(
        config,
        Arc::new(model),
        Arc::new(limiter),
        Arc::new(NullRecordSink),
        Arc::new(registry.clone()),
    );

    if !processor.tools().is_available() {
        bail!("ffmpeg and ffprobe must be installed and on PATH");
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let cancel = registry.register(&job_id);

    let signal_registry = registry.clone();
    let signal_job = job_id.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received interrupt, cancelling after the current stage");
        signal_registry.cancel(&signal_job);
    });

    info!(job_id = %job_id, audio = %job.audio_path.display(), "Starting job");
    let outcome = processor.process(&job_id, &job, &cancel).await;
    match &outcome {
        Ok(result) => registry.complete(&job_id, result.clone()),
        Err(e) => registry.fail(&job_id, e),
    }
    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            if let Some(intervals) = registry.detected_intervals(&job_id) {
                error!("Detected intervals were kept, re-run the edit with these:");
                println!("{}", serde_json::to_string_pretty(&intervals)?);
            }
            Err(e.into())
        }
    }
}
