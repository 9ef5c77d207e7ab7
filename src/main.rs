use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use stillcap::{
    CaptureEvent, CaptureFrame, CaptureState, CaptureStats, ChannelFrameSink, EventRegistry,
    FrameType, ImageCapture, OperatingMode, SimulatedComponent, StillcapConfig,
};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "stillcap")]
#[command(about = "Still-image capture lifecycle driver for component-based camera pipelines")]
#[command(version)]
#[command(long_about = "Drives the still-capture lifecycle (buffer provisioning, burst or \
bracketed capture, teardown) against a simulated image component and reports what was \
delivered.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "stillcap.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without capturing")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Run a bracketed capture instead of a plain burst
    #[arg(long, help = "Run continuous bracketing, then finish with a capture request")]
    bracketing: bool,

    /// Print the run summary as JSON
    #[arg(long, help = "Print the capture summary as JSON")]
    json: bool,
}

#[derive(Debug, Serialize)]
struct FrameSummary {
    index: usize,
    length: usize,
    frame_type: FrameType,
}

impl From<&CaptureFrame> for FrameSummary {
    fn from(frame: &CaptureFrame) -> Self {
        Self {
            index: frame.index,
            length: frame.length,
            frame_type: frame.frame_type,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    session: Option<String>,
    mode: OperatingMode,
    bracketing: bool,
    buffer_count: usize,
    buffer_size: usize,
    frames: Vec<FrameSummary>,
    clean_stop: bool,
    final_state: CaptureState,
    stats: CaptureStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting stillcap v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match StillcapConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let summary = run(&config, args.bracketing).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(())
}

async fn run(config: &StillcapConfig, bracketing: bool) -> Result<RunSummary> {
    let registry = Arc::new(EventRegistry::new());
    let (sim, completions) = SimulatedComponent::new(Arc::clone(&registry), config.simulator.clone());
    let sim = Arc::new(sim);
    let (sink, mut frames) = ChannelFrameSink::new();

    let capture = ImageCapture::builder()
        .component(sim.clone(), registry)
        .sink(Arc::new(sink))
        .mode(config.adapter.operating_mode)
        .timeouts(config.adapter.timeouts())
        .event_bus_capacity(config.adapter.event_bus_capacity)
        .build()?;
    let capture = Arc::new(capture);

    capture.set_release_callback(|| debug!("Capture buffers handed back"));
    let pump = capture.spawn_completion_pump(completions);
    let monitor = spawn_event_monitor(capture.subscribe());

    let buffer_count = config.adapter.buffer_count;
    capture.set_parameters(&config.capture).await?;
    let buffer_size = capture
        .picture_buffer_size(buffer_count)
        .await?
        .max(config.adapter.buffer_size_hint);
    capture.provision(buffer_count, buffer_size).await?;
    let session = capture.session_id().map(|id| id.to_string());

    let burst = capture.settings().burst_frames;
    let idle = config.adapter.timeouts().capture;

    let expected = if bracketing {
        sim.update_behavior(|b| b.auto_complete = false);
        capture.start_bracketing(burst).await?;

        // Let the ring cycle through every buffer twice
        for _ in 0..buffer_count * 2 {
            sim.complete_next();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let ring = capture.ring().snapshot();
        let held = ring.queued.len() - ring.queued_count;
        info!("Finishing bracketed burst with {} held frame(s)", held);
        start_capture(&capture).await?;
        held + burst
    } else {
        start_capture(&capture).await?;
        if !config.simulator.auto_complete {
            sim.complete_next();
        }
        burst
    };

    let mut delivered = Vec::with_capacity(expected);
    while delivered.len() < expected {
        let frame = match tokio::time::timeout(idle, frames.recv()).await {
            Ok(Some(frame)) => frame,
            _ => {
                warn!(
                    "Stopped waiting for frames after {} of {}",
                    delivered.len(),
                    expected
                );
                break;
            }
        };
        delivered.push(FrameSummary::from(&frame));
        capture.return_frame(frame.index, frame.frame_type).await?;
        sim.complete_next();
    }

    let clean_stop = match capture.stop_capture().await {
        Ok(()) => true,
        Err(e) if e.is_soft() => {
            warn!("Capture stopped with degraded certainty: {}", e);
            false
        }
        Err(e) => {
            error!("Capture teardown failed: {}", e);
            false
        }
    };

    capture.shutdown();
    if let Err(e) = pump.await {
        warn!("Completion pump ended abnormally: {}", e);
    }
    monitor.abort();

    Ok(RunSummary {
        session,
        mode: capture.mode(),
        bracketing,
        buffer_count,
        buffer_size,
        frames: delivered,
        clean_stop,
        final_state: capture.state(),
        stats: capture.stats(),
    })
}

/// Soft failures (missed shutter) are reported and the run continues
async fn start_capture(capture: &ImageCapture) -> Result<()> {
    match capture.start_capture().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_soft() => {
            warn!("Capture started without confirmation: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn spawn_event_monitor(
    mut events: tokio::sync::broadcast::Receiver<CaptureEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!("Capture event: {}", event.description());
        }
    })
}

fn print_summary(summary: &RunSummary) {
    println!("Capture session: {}", summary.session.as_deref().unwrap_or("-"));
    println!(
        "Mode: {:?}{}",
        summary.mode,
        if summary.bracketing { " (bracketing)" } else { "" }
    );
    println!(
        "Buffers: {} x {} bytes",
        summary.buffer_count, summary.buffer_size
    );
    println!("Frames delivered: {}", summary.frames.len());
    for frame in &summary.frames {
        println!(
            "  buffer {:>2}  {:>8} bytes  {:?}",
            frame.index, frame.length, frame.frame_type
        );
    }
    println!(
        "Shutter events: {}, timeouts: {}",
        summary.stats.shutter_events, summary.stats.timeouts
    );
    println!(
        "Stop: {} (final state {:?})",
        if summary.clean_stop { "clean" } else { "degraded" },
        summary.final_state
    );
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stillcap={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Stillcap Configuration File");
    println!("# Environment overrides use STILLCAP_<SECTION>__<KEY>, e.g. STILLCAP_ADAPTER__BUFFER_COUNT=6");
    println!();
    println!("{}", toml::to_string_pretty(&StillcapConfig::default())?);
    Ok(())
}
