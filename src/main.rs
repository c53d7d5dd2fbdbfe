// src/main.rs - Replays a G-code file through the timelapse coordinator
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::io::AllowStdIo;
use lapse_rs::camera::HttpCamera;
use lapse_rs::host::{self, HostHandle};
use lapse_rs::simulator::{Replay, SimulatedPrinter};
use lapse_rs::{TimelapseCoordinator, TimelapseEvent, load_config};
use lapse_shared::gcode::AsyncGCodeParser;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "lapse-host", version, about = "Timelapse snapshot coordinator")]
struct Args {
    /// Path to the timelapse configuration file
    #[arg(short, long, default_value = "lapse.toml")]
    config: String,

    /// G-code file to replay through the simulated printer
    #[arg(short, long)]
    gcode: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let session = uuid::Uuid::new_v4();
    tracing::info!("Starting lapse-host session {}", session);
    tracing::info!("Loading configuration from: {}", args.config);

    let config = load_config(&args.config).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", args.config, e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;
    tracing::info!(
        "Printer: {}",
        config.printer.printer_name.as_deref().unwrap_or("Unknown")
    );
    tracing::info!("Triggers configured: {}", config.triggers.len());

    let (printer, actions) = SimulatedPrinter::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TimelapseEvent>();
    let printer_config = config.printer.clone();
    let camera_config = config.camera.clone();

    let mut coordinator = TimelapseCoordinator::new(config, Arc::new(printer), event_tx);
    if camera_config.enabled {
        let camera = HttpCamera::new(camera_config)?;
        camera.apply_settings();
        coordinator = coordinator.with_camera(Arc::new(camera));
    } else {
        tracing::info!("Camera disabled; snapshots will be recorded as failed");
    }

    let event_log = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!("event: {}", json),
                Err(e) => tracing::warn!("Failed to serialize {} event: {}", event.name(), e),
            }
            count += 1;
        }
        count
    });

    let (host_tx, host_rx) = mpsc::channel(64);
    let service = tokio::spawn(host::run(coordinator, host_rx, Duration::from_millis(100)));
    let handle = HostHandle::new(host_tx);

    let file = std::fs::File::open(&args.gcode)?;
    let reader = AllowStdIo::new(std::io::BufReader::new(file));
    let lines = Box::pin(AsyncGCodeParser::new(reader).into_stream());

    let summary = Replay::new(handle.clone(), actions, &printer_config)
        .run(&args.gcode, lines)
        .await?;
    handle.send(host::HostEvent::Shutdown).await?;
    let coordinator = service.await??;
    let (taken, failed) = coordinator
        .job()
        .map(|job| (job.snapshot_count, job.failed_snapshot_count))
        .unwrap_or_default();
    // Dropping the coordinator closes the event channel.
    drop(coordinator);
    let events = event_log.await?;

    println!("Replayed {} lines from {}", summary.lines, args.gcode);
    println!("  executed:   {}", summary.executed);
    println!("  suppressed: {}", summary.suppressed);
    println!("  injected:   {}", summary.injected);
    println!("  pauses:     {}", summary.pauses);
    println!("  snapshots:  {} ({} failed)", taken, failed);
    println!("  events:     {}", events);
    Ok(())
}
