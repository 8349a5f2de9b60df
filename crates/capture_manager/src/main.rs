use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use capture_config::PipelineConfig;
use capture_manager::CaptureManager;
use capture_manager::synthetic::{SyntheticScene, SyntheticSceneQuery, camera_view};
use capture_protocol::ImageExtent;
use clap::Parser;
use emitter::{ChannelReceiver, JsonLinesTransport, MessageTransport, channel_transport};
use readback::{ReadbackSource, RenderThreadConfig, RenderThreadSource};

#[derive(Parser)]
#[command(author, version, about = "Run the capture pipeline against a synthetic scene")]
struct Arguments {
    /// Pipeline config (JSON). Defaults are used when omitted.
    #[arg(long, short = 'c', value_parser)]
    config: Option<PathBuf>,
    /// Number of simulation ticks to run.
    #[arg(long, default_value_t = 120)]
    ticks: u64,
    /// Simulation tick rate.
    #[arg(long, default_value_t = 60.0)]
    tick_rate_hz: f64,
    /// Synthetic render target width.
    #[arg(long, default_value_t = 640)]
    width: u32,
    /// Synthetic render target height.
    #[arg(long, default_value_t = 360)]
    height: u32,
    /// Simulated GPU readback latency.
    #[arg(long, default_value_t = 30)]
    readback_latency_ms: u64,
    /// Write events as JSON lines to this file instead of stdout.
    #[arg(long, short = 'o', value_parser)]
    output: Option<PathBuf>,
    /// Stamp projected actor outlines onto the classified image.
    #[arg(long)]
    overlay: bool,
    /// Override the configured instance name.
    #[arg(long)]
    instance_name: Option<String>,
    /// Override the configured capture cadence.
    #[arg(long)]
    frame_mod: Option<u32>,
    /// Run without a capture target to exercise the missing-target path.
    #[arg(long)]
    no_capture_target: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let arguments = Arguments::parse();
    let mut config = match &arguments.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("load pipeline config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(instance_name) = &arguments.instance_name {
        config.instance_name = instance_name.clone();
    }
    if let Some(frame_mod) = arguments.frame_mod {
        config.frame_mod = frame_mod;
    }
    if arguments.overlay {
        config.overlay.enabled = true;
    }
    config.validate().context("validate pipeline config")?;
    if !(arguments.tick_rate_hz.is_finite() && arguments.tick_rate_hz > 0.0) {
        anyhow::bail!("tick rate must be a positive number");
    }

    let extent = ImageExtent::new(arguments.width, arguments.height);
    let source: Option<Box<dyn ReadbackSource>> = if arguments.no_capture_target {
        None
    } else {
        let mut source = RenderThreadSource::start(
            RenderThreadConfig {
                extent,
                submit_queue_capacity: 2,
                readback_latency: Duration::from_millis(arguments.readback_latency_ms),
            },
            SyntheticScene::new(),
        )
        .context("start render thread")?;
        source.set_view(camera_view(extent));
        Some(Box::new(source))
    };

    let writer: Box<dyn Write + Send> = match &arguments.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create output {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout()),
    };
    let shutdown_timeout = Duration::from_millis(config.shutdown_timeout_ms);
    let (transport, receiver) =
        channel_transport(config.transport_capacity).context("create transport mailbox")?;
    let writer_stop = Arc::new(AtomicBool::new(false));
    let writer_thread =
        spawn_event_writer(receiver, JsonLinesTransport::new(writer), Arc::clone(&writer_stop))
            .context("start event writer")?;
    let mut manager = CaptureManager::new(
        config,
        source,
        Box::new(transport),
        Some(Arc::new(SyntheticSceneQuery::default())),
    )
    .context("create capture manager")?;

    let tick_interval = Duration::from_secs_f64(1.0 / arguments.tick_rate_hz);
    let mut next_deadline = Instant::now();
    for _ in 0..arguments.ticks {
        let report = manager.on_tick();
        if report.drained.is_some() || report.issued.is_some() {
            tracing::debug!(?report, "tick");
        }
        next_deadline += tick_interval;
        let now = Instant::now();
        if next_deadline > now {
            std::thread::sleep(next_deadline - now);
        } else {
            next_deadline = now;
        }
    }

    let stats = manager.stats();
    let scheduler = manager.scheduler_stats();
    let pool = manager.pool_stats();
    let tasks = manager.task_stats();
    tracing::info!(
        ticks = stats.ticks,
        captures = stats.captures_issued,
        frames = stats.frames_processed,
        emit_failures = stats.emit_failures,
        skipped_in_flight = scheduler.skipped_in_flight,
        failed_readbacks = pool.failed,
        inference_completed = stats.inference_completed,
        inference_replaced = tasks.replaced,
        missing_target = stats.missing_target,
        "run finished"
    );
    manager.shutdown(shutdown_timeout);

    writer_stop.store(true, Ordering::Release);
    match writer_thread.join() {
        Ok((written, dropped)) => tracing::info!(written, dropped, "event writer stopped"),
        Err(_) => anyhow::bail!("event writer panicked"),
    }
    Ok(())
}

/// Moves events from the tick-side mailbox to the output off the tick thread.
/// Returns the written and mailbox-dropped event counts.
fn spawn_event_writer(
    receiver: ChannelReceiver,
    mut output: JsonLinesTransport<Box<dyn Write + Send>>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<(u64, u64)>> {
    std::thread::Builder::new()
        .name("event_writer".to_owned())
        .spawn(move || {
            loop {
                let stopping = stop.load(Ordering::Acquire);
                while let Some(event) = receiver.pop() {
                    output.send(&event.event_name, event.payload);
                }
                if stopping {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            (output.written(), receiver.dropped_events())
        })
}
