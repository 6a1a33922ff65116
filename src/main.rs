use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edgewatch::accel::mock::MockDevice;
use edgewatch::accel::AcceleratorSession;
use edgewatch::{DaemonConfig, StreamManager};

#[derive(Parser, Debug)]
#[command(name = "edgewatch")]
#[command(about = "Multi-stream RTSP video analytics daemon")]
#[command(version)]
#[command(
    long_about = "Ingests RTSP video streams, runs per-frame inference on a shared \
accelerator, evaluates configured event topologies (regions, lines, angle violations) \
and publishes per-frame detection events to a message bus."
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "edgewatch.toml")]
    config: String,

    /// Print default configuration in TOML format and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration file and exit without starting the daemon
    #[arg(long)]
    validate_config: bool,

    /// Override message bus URL
    #[arg(short, long, value_name = "URL")]
    nats_url: Option<String>,

    /// Enable debug level logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose info level logging
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode - only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Log output format: json, pretty, or compact
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,
}

fn init_logging(args: &Args, config: &DaemonConfig) {
    let level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        &config.log.level
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let format = args.log_format.as_deref().unwrap_or(&config.log.format);
    match format {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", DaemonConfig::default_toml()?);
        return Ok(());
    }

    let mut config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if let Some(url) = &args.nats_url {
        config.nats.url = url.clone();
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    if args.validate_config {
        println!("Configuration OK: {}", args.config);
        return Ok(());
    }

    init_logging(&args, &config);

    info!("Starting edgewatch daemon");
    info!("Bus URL: {}", config.nats.url);
    info!("Max streams: {}", config.performance.max_streams);

    // The accelerator runtime binds behind the device seam; without a
    // vendor binding the built-in mock serves, and model streams report
    // the device as unavailable.
    let session = AcceleratorSession::init_global(Arc::new(MockDevice::new()));

    #[cfg(feature = "gst")]
    let ingest_factory: Arc<dyn edgewatch::ingest::IngestFactory> = {
        match edgewatch::ingest::gst::GstIngestFactory::new() {
            Ok(factory) => Arc::new(factory),
            Err(e) => {
                error!("Failed to initialize GStreamer ingest: {}", e);
                std::process::exit(1);
            }
        }
    };

    #[cfg(not(feature = "gst"))]
    let ingest_factory: Arc<dyn edgewatch::ingest::IngestFactory> = {
        warn!("Built without the gst feature; ingest sources are inert");
        Arc::new(edgewatch::ingest::mock::MockIngestFactory::new())
    };

    let manager = Arc::new(StreamManager::new(
        &config,
        Arc::clone(&session),
        ingest_factory,
    ));
    manager.start().await;

    manager
        .set_global_detection_callback(Arc::new(|event| {
            tracing::debug!(
                "Detection on {}: {} objects",
                event.stream_id,
                event.detections.len()
            );
        }))
        .await;

    manager
        .set_global_state_change_callback(Arc::new(|stream_id, state| {
            info!("Stream {} state changed to: {}", stream_id, state);
        }))
        .await;

    manager
        .set_global_error_callback(Arc::new(|stream_id, error| {
            error!("Stream {} error: {}", stream_id, error);
        }))
        .await;

    info!("Daemon started. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    manager.stop().await;
    session.shutdown();

    info!("Daemon stopped");
    Ok(())
}
