//! CLI entry point for liveview
//!
//! Runs the pipeline headless and reports what a display would show: the latest frame of
//! each stream, polled at the configured display period.
//!
//! # Usage
//!
//! Run with the configured source until Ctrl+C:
//! ```bash
//! liveview run --config config/liveview.toml
//! ```
//!
//! Run for ten seconds and record 100 raw frames:
//! ```bash
//! liveview run --duration 10 --record capture.raw --record-frames 100
//! ```
//!
//! Validate a configuration file:
//! ```bash
//! liveview check-config --config config/liveview.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use liveview::config::{Config, DEFAULT_CONFIG_PATH};
use liveview::{logging, FrameWorker, PipelineEvent, SaveRequest, StreamKind, StreamReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// How long to wait for a recording to reach the disk after the pipeline stopped.
const RECORDER_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "liveview")]
#[command(about = "Live detector-frame pipeline: raw, dark-subtracted and std-dev streams", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire and process frames until Ctrl+C, the duration elapses or the source ends
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Record raw frames to this file
        #[arg(long)]
        record: Option<PathBuf>,

        /// Number of frames to record
        #[arg(long, default_value = "100", requires = "record")]
        record_frames: u64,

        /// Apply this dark mask instead of the configured one
        #[arg(long, conflicts_with = "collect_dark")]
        mask: Option<PathBuf>,

        /// Collect a dark mask from the first N frames
        #[arg(long)]
        collect_dark: Option<usize>,

        /// Write the collected or applied dark mask here on exit
        #[arg(long)]
        save_mask: Option<PathBuf>,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    config.validate().context("invalid configuration")?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run {
            duration,
            record,
            record_frames,
            mask,
            collect_dark,
            save_mask,
        } => {
            let duration = duration
                .map(Duration::try_from_secs_f64)
                .transpose()
                .context("--duration must be a non-negative number of seconds")?;
            let options = RunOptions {
                duration,
                record: record.map(|path| SaveRequest::new(path, record_frames)),
                mask,
                collect_dark,
                save_mask,
            };
            run(config, options).await
        }
        Commands::CheckConfig => {
            println!("{config:#?}");
            println!("Configuration OK");
            Ok(())
        }
    }
}

struct RunOptions {
    duration: Option<Duration>,
    record: Option<SaveRequest>,
    mask: Option<PathBuf>,
    collect_dark: Option<usize>,
    save_mask: Option<PathBuf>,
}

async fn run(config: Config, options: RunOptions) -> Result<()> {
    let worker = Arc::new(FrameWorker::from_config(&config).context("creating pipeline")?);
    let mut events = worker.subscribe();

    if let Some(path) = &options.mask {
        worker.apply_mask(path)?;
    }
    if let Some(frames) = options.collect_dark {
        worker.collect_dark_mask(frames)?;
    }

    info!(
        name = %config.application.name,
        width = worker.frame_width(),
        height = worker.frame_height(),
        "starting pipeline"
    );
    worker.start()?;
    let mut recording = options.record.is_some();
    if let Some(request) = options.record {
        worker.start_saving(request)?;
    }

    let readers: Vec<StreamReader> = StreamKind::ALL.iter().map(|&kind| worker.reader(kind)).collect();
    let mut last_seen = vec![0u64; readers.len()];
    let mut display = tokio::time::interval(config.pipeline.display_period());
    let mut report = tokio::time::interval(Duration::from_secs(1));
    let deadline = options.duration.map(|d| tokio::time::Instant::now() + d);
    let started = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = sleep_until(deadline) => {
                info!("duration elapsed");
                break;
            }
            _ = display.tick() => {
                for (reader, seen) in readers.iter().zip(last_seen.iter_mut()) {
                    if let Some(frame) = reader.latest() {
                        *seen = frame.sequence();
                    }
                }
            }
            _ = report.tick() => {
                let stats = worker.stats();
                let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                let fps = (stats.frames_acquired as f64 / elapsed * 10.0).round() / 10.0;
                info!(
                    fps,
                    raw = last_seen[0],
                    dark = last_seen[1],
                    std_dev = last_seen[2],
                    dark_skipped = stats.dark_skipped,
                    std_dev_skipped = stats.std_dev_skipped,
                    "pipeline status"
                );
            }
            event = events.recv() => match event {
                Ok(PipelineEvent::Stopped { status }) => {
                    info!(?status, "pipeline stopped");
                    break;
                }
                Ok(PipelineEvent::AcquisitionError { message, fatal }) => {
                    warn!(%message, fatal, "pipeline error");
                }
                Ok(PipelineEvent::SaveFinished { path, frames_written, dropped }) => {
                    info!(path = %path.display(), frames_written, dropped, "recording saved");
                    recording = false;
                }
                Ok(event) => info!(?event, "pipeline event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event receiver lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stopper = Arc::clone(&worker);
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("joining shutdown task")??;

    // Stopping closes the recording; let the writer flush what it has.
    if recording {
        let finished = tokio::time::timeout(RECORDER_GRACE, async {
            loop {
                match events.recv().await {
                    Ok(PipelineEvent::SaveFinished { path, frames_written, dropped }) => {
                        info!(path = %path.display(), frames_written, dropped, "recording saved");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                    _ => {}
                }
            }
        })
        .await;
        if finished.is_err() {
            warn!("recorder did not finish in time");
        }
    }

    if let Some(path) = &options.save_mask {
        worker.save_dark_mask(path)?;
        info!(path = %path.display(), "dark mask saved");
    }

    let stats = worker.stats();
    info!(
        frames = stats.frames_acquired,
        status = ?worker.status(),
        recorder_dropped = stats.recorder_dropped,
        "done"
    );
    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
