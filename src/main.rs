use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use oie::api::{self, AppState};
use oie::broadcast::SnapshotBroadcaster;
use oie::config::RunnerConfig;
use oie::runner::RunnerRegistry;
use oie::types::RunnerKey;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Port to run the web server on
    #[arg(short, long, env = "OIE_PORT", default_value = "8000")]
    port: u16,

    /// Address to bind
    #[arg(long, env = "OIE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Supported symbols (comma-separated)
    #[arg(
        short,
        long,
        env = "OIE_SYMBOLS",
        default_value = "BTCUSDT,ETHUSDT,SOLUSDT,BNBUSDT,XRPUSDT"
    )]
    symbols: String,

    /// Runner configuration (TOML); defaults when absent
    #[arg(short, long, env = "OIE_CONFIG")]
    config: Option<PathBuf>,

    /// CSV of bars replayed into each started runner
    #[arg(short, long, env = "OIE_REPLAY_FILE")]
    replay: Option<PathBuf>,

    /// Delay between replayed bars in milliseconds
    #[arg(long, env = "OIE_REPLAY_PACE_MS", default_value = "0")]
    replay_pace_ms: u64,

    /// Runners to start at boot (comma-separated SYMBOL_interval)
    #[arg(long, env = "OIE_AUTOSTART")]
    autostart: Option<String>,

    /// Fixed Monte Carlo seed for reproducible runs
    #[arg(long, env = "OIE_SEED")]
    seed: Option<u64>,
}

fn load_config(args: &Args) -> Result<RunnerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {:?}", path))?;
            RunnerConfig::from_toml_str(&text)
                .with_context(|| format!("Invalid config: {:?}", path))?
        }
        None => RunnerConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.predictive.seed = Some(seed);
    }
    config.validate().context("Invalid runner configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("oie=info".parse().context("Invalid log directive")?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!("Starting OIE server");
    info!("Symbols: {}", args.symbols);
    info!("Port: {}", args.port);
    if let Some(path) = &args.replay {
        info!("Replay file: {:?} ({} ms/bar)", path, args.replay_pace_ms);
    }

    let broadcaster = Arc::new(SnapshotBroadcaster::default());
    let state = Arc::new(AppState {
        registry: RunnerRegistry::with_default_config(broadcaster, config),
        symbols: args
            .symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        replay_file: args.replay.clone(),
        replay_pace: Duration::from_millis(args.replay_pace_ms),
    });

    if let Some(list) = &args.autostart {
        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let key: RunnerKey = raw
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid autostart key: {}", raw))?;
            state
                .registry
                .start(key.clone(), None)
                .await
                .with_context(|| format!("Failed to start {}", key))?;
        }
    }

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/api/v1/symbols", get(api::get_symbols))
        .route("/api/v1/trading/status", get(api::get_status))
        .route("/api/v1/trading/status/{key}", get(api::get_runner_status))
        .route("/api/v1/trading/start", post(api::start_trading))
        .route("/api/v1/trading/start-all", post(api::start_all_trading))
        .route("/api/v1/trading/stop", post(api::stop_trading))
        .route("/api/v1/trading/bars/{key}", post(api::submit_bars))
        .route("/api/v1/trades", get(api::get_trades))
        .route("/api/v1/signals", get(api::get_signals))
        .route("/ws/live", get(api::ws_live))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", args.host, args.port))?;
    info!("Server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    for (key, stats) in state.registry.stop_all().await {
        info!("{} final: {}", key, stats.summary());
    }
    Ok(())
}
