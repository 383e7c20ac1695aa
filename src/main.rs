//! camnode simulator - Main Entry Point
//!
//! Builds a pipeline from a TOML description, drives a run of requests
//! through it on the simulated device and reports the outcome.

use anyhow::Context;
use camnode::{
    config::PipelineConfig,
    pipeline::{PipelineBuilder, PipelineEvent},
};
use clap::Parser;
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "camnode-sim")]
#[command(about = "Drive requests through a simulated camera pipeline")]
#[command(version)]
struct Cli {
    /// Pipeline description (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Number of requests to submit
    #[arg(short = 'n', long, default_value = "16")]
    requests: u64,

    /// Flush this request right after submitting it (repeatable)
    #[arg(long)]
    flush: Vec<u64>,

    /// Also write logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Print a JSON state dump of every node when done
    #[arg(long)]
    dump: bool,

    /// How long to wait for the pipeline to drain, in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,
}

#[derive(Debug, Default)]
struct RunSummary {
    completed: u64,
    failed: u64,
    sink_buffers: u64,
    recovery_errors: u64,
}

impl RunSummary {
    fn absorb(&mut self, events: &Receiver<PipelineEvent>) {
        for event in events.try_iter() {
            match event {
                PipelineEvent::RequestCompleted { failed, .. } => {
                    self.completed += 1;
                    if failed {
                        self.failed += 1;
                    }
                }
                PipelineEvent::SinkBufferReady { .. } => self.sink_buffers += 1,
                PipelineEvent::RecoveryError { .. } => self.recovery_errors += 1,
                _ => {}
            }
        }
    }
}

fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {:?}", dir))?;
            let appender = tracing_appender::rolling::never(dir, "camnode-sim.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,camnode=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_deref())?;

    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading pipeline {:?}", cli.config))?;
    tracing::info!(
        "Starting camnode simulator on '{}' ({} nodes)",
        config.name,
        config.nodes.len()
    );

    let pipeline = PipelineBuilder::new(config.clone())
        .build()
        .context("building pipeline")?;
    let events = pipeline.events();
    let mut summary = RunSummary::default();
    let started = Instant::now();

    for request_id in 0..cli.requests {
        pipeline
            .submit_request(config.capture_request(request_id))
            .with_context(|| format!("submitting request {}", request_id))?;
        if cli.flush.contains(&request_id) {
            pipeline
                .flush_request(request_id)
                .with_context(|| format!("flushing request {}", request_id))?;
        }
        summary.absorb(&events);
    }

    let drained = pipeline.wait_idle(Duration::from_millis(cli.timeout_ms));
    summary.absorb(&events);

    if cli.dump {
        println!("{}", pipeline.dump_json()?);
    }

    tracing::info!(
        "{} of {} requests completed ({} failed, {} sink buffers) in {:?}",
        summary.completed,
        cli.requests,
        summary.failed,
        summary.sink_buffers,
        started.elapsed()
    );
    if summary.recovery_errors > 0 {
        tracing::warn!("{} recovery errors reported", summary.recovery_errors);
    }

    let stuck = pipeline.in_flight_requests();
    pipeline.destroy();
    if !drained {
        anyhow::bail!(
            "pipeline did not drain within {} ms; still in flight: {:?}",
            cli.timeout_ms,
            stuck
        );
    }
    Ok(())
}
