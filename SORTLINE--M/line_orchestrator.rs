use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use sortline_actuation::SimulatedActuatorDriver;
use sortline_conveyor::SimulatedRelayDriver;
use sortline_core::{ActuatorState, Category, Clock, LineConfig, LineTelemetry, TokioClock};
use sortline_pipeline::{
    ChannelDetectionSource, JsonlDetectionSource, LineControl, LineDrivers, LineRuntime,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sortline", version, about = "Fruit sorting line controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replays a detection capture through the full line on simulated outputs.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        detections: PathBuf,
        /// JSON-lines telemetry log.
        #[arg(long)]
        log: Option<PathBuf>,
        /// JSON-lines event log.
        #[arg(long)]
        events: Option<PathBuf>,
        /// Feed detections as fast as they can be read.
        #[arg(long)]
        no_pace: bool,
    },
    /// Validates a line configuration and prints it normalized.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Fires one actuator on simulated outputs.
    TestFire {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Diverter category; the marker when omitted.
        #[arg(long)]
        divert: Option<String>,
        #[arg(long, default_value_t = 600)]
        duration_ms: u64,
        #[arg(long, default_value_t = 80.0)]
        intensity: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sortline=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            detections,
            log,
            events,
            no_pace,
        } => run(config, detections, log, events, no_pace).await,
        Commands::CheckConfig { config } => check_config(&config),
        Commands::TestFire {
            config,
            divert,
            duration_ms,
            intensity,
        } => test_fire(config, divert, duration_ms, intensity).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<LineConfig> {
    match path {
        Some(path) => LineConfig::load(path),
        None => Ok(LineConfig::default()),
    }
}

fn simulated_drivers(config: &LineConfig, clock: &Arc<TokioClock>) -> LineDrivers {
    let clock: Arc<dyn Clock> = clock.clone();
    LineDrivers::new(
        Arc::new(SimulatedActuatorDriver::new()),
        Arc::new(SimulatedRelayDriver::new(clock, config.belt.active_low)),
    )
}

fn telemetry(log: Option<PathBuf>, events: Option<PathBuf>) -> Result<Option<LineTelemetry>> {
    if log.is_none() && events.is_none() {
        return Ok(None);
    }
    let mut builder = LineTelemetry::builder("line").min_level(LogLevel::Info);
    if let Some(path) = log {
        builder = builder.log_path(path);
    }
    if let Some(path) = events {
        let publisher = FileEventPublisher::new(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        builder = builder.event_publisher(Arc::new(publisher));
    }
    builder.build().map(Some)
}

async fn run(
    config: Option<PathBuf>,
    detections: PathBuf,
    log: Option<PathBuf>,
    events: Option<PathBuf>,
    no_pace: bool,
) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let clock = Arc::new(TokioClock::new());
    let telemetry = telemetry(log, events)?;

    let mut source = JsonlDetectionSource::open(&detections)
        .await
        .with_context(|| format!("opening detections {}", detections.display()))?;
    if !no_pace {
        source = source.paced(clock.clone());
    }

    let mut runtime = LineRuntime::spawn(
        &config,
        simulated_drivers(&config, &clock),
        clock.clone(),
        telemetry,
        Box::new(source),
    )?;
    let control = runtime.control();
    control.start_forward().await?;
    info!("belt running, replaying {}", detections.display());

    let keepalive = tokio::spawn(keep_belt_alive(
        control.clone(),
        config.belt.safety_timeout() / 2,
    ));
    let drained = tokio::select! {
        drained = runtime.drain() => drained,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping line");
            control.emergency_stop().await?;
            Ok(control.status())
        }
    };
    keepalive.abort();
    drained?;

    control.stop().await?;
    let status = runtime.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn keep_belt_alive(control: LineControl, every: Duration) {
    loop {
        tokio::time::sleep(every).await;
        if let Err(err) = control.heartbeat().await {
            warn!(%err, "belt heartbeat failed");
            return;
        }
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = LineConfig::load(path)?;
    let summary = json!({
        "config": path.display().to_string(),
        "actuators": config
            .actuator_ids()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        "line": config,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn test_fire(
    config: Option<PathBuf>,
    divert: Option<String>,
    duration_ms: u64,
    intensity: f32,
) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let clock = Arc::new(TokioClock::new());
    let (_detections, source) = ChannelDetectionSource::channel(1);
    let runtime = LineRuntime::spawn(
        &config,
        simulated_drivers(&config, &clock),
        clock.clone(),
        None,
        Box::new(source),
    )?;
    let control = runtime.control();

    let accepted = match divert {
        Some(label) => {
            let category: Category = label.parse()?;
            control.divert_test_fire(category).await?
        }
        None => {
            control
                .mark_actuator_test_fire(Duration::from_millis(duration_ms), intensity)
                .await?
        }
    };
    info!(actuator = %accepted.actuator_id, "test fire accepted");
    if let Some(mut feed) = control.subscribe_actuator(accepted.actuator_id) {
        loop {
            let settled = {
                let snapshot = feed.borrow_and_update();
                snapshot.persistent_fault
                    || (snapshot.state == ActuatorState::Idle
                        && snapshot.active_event.is_none()
                        && snapshot.queued_event.is_none())
            };
            if settled || feed.changed().await.is_err() {
                break;
            }
        }
    }

    let status = runtime.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&status.actuators)?);
    Ok(())
}
