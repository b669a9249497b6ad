use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use triad_agents::{Agent, ModeRegistry, Recorder, Role, Router};
use triad_storm::{Coordinator, CoordinatorConfig, StormConfig};
use triad_store::HistoryStore;
use triad_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "triad", about = "Coordination core for the triad multi-agent terminal assistant")]
struct Cli {
    /// Data directory for room history and core memory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Port for the task coordinator endpoint.
    #[arg(long, default_value_t = 8765)]
    port: u16,

    /// Default chat room the recorder joins.
    #[arg(long, default_value = "main")]
    room: String,

    /// Per-room ring buffer capacity.
    #[arg(long, default_value_t = 10_000)]
    buffer_capacity: usize,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json: cli.json_logs,
        ..Default::default()
    });

    let data_dir = cli.data_dir.unwrap_or_else(|| dirs_home().join(".triad"));
    let store = Arc::new(HistoryStore::open(&data_dir, cli.buffer_capacity)?);
    tracing::info!(path = %data_dir.display(), "history store opened");

    let router = Arc::new(Router::new());
    let modes = Arc::new(ModeRegistry::new());
    tracing::info!(room = %cli.room, mode = %modes.mode(&cli.room), "default room mode");

    let mut recorder = Agent::new("recorder", Role::new("system").with_icon("·"));
    recorder.attach(Arc::clone(&router));
    recorder.join(&cli.room)?;
    recorder.start(Box::new(Recorder::new(Arc::clone(&store))))?;

    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
    let storm = triad_storm::start(
        StormConfig {
            port: cli.port,
            ..Default::default()
        },
        Arc::clone(&coordinator),
    )
    .await?;

    tracing::info!(port = storm.port, room = %cli.room, "triad core ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    coordinator.stop().await;
    recorder.stop().await;
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
