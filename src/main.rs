use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

use echelon_engine::{spawn_retention_sweeper, RunController};
use echelon_model::{HttpProvider, HttpProviderConfig, ReliableConfig, ReliableProvider};
use echelon_store::Database;
use echelon_telemetry::{init_telemetry, TelemetryConfig};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser)]
#[command(name = "echelon", about = "Hierarchical execution engine server")]
struct Cli {
    /// HTTP port to listen on.
    #[arg(long, default_value_t = 8710)]
    port: u16,

    /// Path to the SQLite database. Defaults to ~/.echelon/database/engine.db.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Upstream chat-completions endpoint.
    #[arg(long, env = "ECHELON_API_URL")]
    api_url: String,

    /// Upstream API key.
    #[arg(long, env = "ECHELON_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Model name sent to the upstream endpoint.
    #[arg(long, env = "ECHELON_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// Emit JSON-formatted logs.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        json_output: cli.json_logs,
        ..Default::default()
    });

    tracing::info!("starting echelon server");

    let db_path = cli.db_path.unwrap_or_else(|| {
        dirs_home().join(".echelon").join("database").join("engine.db")
    });
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).expect("failed to create database directory");
    }
    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let provider = HttpProvider::new(HttpProviderConfig {
        api_url: cli.api_url,
        api_key: SecretString::from(cli.api_key),
        model: cli.model.clone(),
    })
    .expect("failed to build upstream provider");
    let provider = Arc::new(ReliableProvider::new(provider, ReliableConfig::default()));
    tracing::info!(model = %cli.model, "upstream provider ready");

    let controller = RunController::new(db, provider);
    let _sweeper = spawn_retention_sweeper(controller.bus(), RETENTION_SWEEP_INTERVAL);

    let config = echelon_server::ServerConfig {
        port: cli.port,
        ..Default::default()
    };
    let handle = echelon_server::start(config, controller.clone())
        .await
        .expect("failed to start server");
    tracing::info!(port = handle.port, "echelon server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
    controller.cancel_all();
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
