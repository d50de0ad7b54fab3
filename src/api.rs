use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::broadcast::SubscriptionFilter;
use crate::engines::Signal;
use crate::error::RegistryError;
use crate::execution::ClosedTrade;
use crate::runner::{BarSender, RunnerRegistry, RunnerSnapshot};
use crate::streams;
use crate::types::{Bar, RunnerKey};

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_INTERVAL: &str = "1m";
pub const DEFAULT_HISTORY_LIMIT: usize = 200;
pub const MAX_HISTORY_LIMIT: usize = 1000;

pub struct AppState {
    pub registry: RunnerRegistry,
    /// Symbols a Runner may be started for
    pub symbols: Vec<String>,
    /// CSV replayed into every newly started Runner
    pub replay_file: Option<PathBuf>,
    pub replay_pace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Init { runners: Vec<Arc<RunnerSnapshot>> },
    Snapshot { snapshot: Arc<RunnerSnapshot> },
    Error { message: String },
    Pong,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub runners: BTreeMap<String, Arc<RunnerSnapshot>>,
}

#[derive(Debug, Deserialize)]
pub struct TradingParams {
    pub symbol: Option<String>,
    pub interval: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartAllParams {
    pub interval: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// `SYMBOL_interval`; all keys when absent
    pub key: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LiveParams {
    /// `SYMBOL_interval`; all keys when absent
    pub key: Option<String>,
}

fn error_json(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({"success": false, "error": message.into()})))
}

fn parse_key(raw: &str) -> Result<RunnerKey, (StatusCode, Json<serde_json::Value>)> {
    raw.parse::<RunnerKey>()
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, e))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// GET /api/v1/symbols
pub async fn get_symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({"symbols": state.symbols}))
}

/// GET /api/v1/trading/status - latest snapshot of every key
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let runners: BTreeMap<String, Arc<RunnerSnapshot>> = state
        .registry
        .broadcaster()
        .latest_all()
        .into_iter()
        .map(|s| (s.key.to_string(), s))
        .collect();
    let running = !state.registry.keys().await.is_empty();
    Json(StatusResponse { running, runners })
}

/// GET /api/v1/trading/status/{key}
pub async fn get_runner_status(
    State(state): State<Arc<AppState>>,
    Path(raw_key): Path<String>,
) -> impl IntoResponse {
    let key = match parse_key(&raw_key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    match state.registry.broadcaster().latest(&key) {
        Some(snapshot) => (StatusCode::OK, Json(serde_json::json!(snapshot))),
        None => error_json(StatusCode::NOT_FOUND, format!("no snapshot for {}", key)),
    }
}

/// POST /api/v1/trading/start?symbol=..&interval=..
pub async fn start_trading(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TradingParams>,
) -> impl IntoResponse {
    let key = RunnerKey::new(
        params.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL),
        params.interval.as_deref().unwrap_or(DEFAULT_INTERVAL),
    );
    if !state.symbols.iter().any(|s| s.eq_ignore_ascii_case(&key.symbol)) {
        return error_json(
            StatusCode::BAD_REQUEST,
            format!("Symbol {} not supported. Use one of: {:?}", key.symbol, state.symbols),
        );
    }

    match state.registry.start(key.clone(), None).await {
        Ok(sender) => {
            spawn_replay(&state, sender);
            (
                StatusCode::OK,
                Json(serde_json::json!({"success": true, "key": key.to_string()})),
            )
        }
        Err(RegistryError::AlreadyRunning(_)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "key": key.to_string(),
                "message": "Already running"
            })),
        ),
        Err(e) => error_json(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    }
}

/// Feed the configured replay file into a freshly started Runner.
fn spawn_replay(state: &AppState, sender: BarSender) {
    let Some(path) = state.replay_file.clone() else {
        return;
    };
    let pace = state.replay_pace;
    tokio::spawn(async move {
        let loaded = tokio::task::spawn_blocking(move || streams::load_csv(&path)).await;
        match loaded {
            Ok(Ok(bars)) => {
                if let Err(e) = streams::run_replay(sender, bars, pace).await {
                    error!("Replay failed: {:#}", e);
                }
            }
            Ok(Err(e)) => error!("Replay load failed: {:#}", e),
            Err(e) => error!("Replay loader panicked: {}", e),
        }
    });
}

/// POST /api/v1/trading/start-all?interval=.. - every supported symbol
pub async fn start_all_trading(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StartAllParams>,
) -> impl IntoResponse {
    let interval = params.interval.unwrap_or_else(|| DEFAULT_INTERVAL.to_string());
    let mut results = BTreeMap::new();
    for symbol in &state.symbols {
        let key = RunnerKey::new(symbol, &interval);
        let result = match state.registry.start(key, None).await {
            Ok(sender) => {
                spawn_replay(&state, sender);
                serde_json::json!({"success": true, "status": "started"})
            }
            Err(RegistryError::AlreadyRunning(_)) => {
                serde_json::json!({"success": true, "status": "already_running"})
            }
            Err(e) => {
                warn!("start-all: {}", e);
                serde_json::json!({"success": false, "status": "failed", "error": e.to_string()})
            }
        };
        results.insert(symbol.clone(), result);
    }
    Json(serde_json::json!({"interval": interval, "results": results}))
}

/// POST /api/v1/trading/stop - one key when both params are given, else all
pub async fn stop_trading(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TradingParams>,
) -> impl IntoResponse {
    if let (Some(symbol), Some(interval)) = (params.symbol, params.interval) {
        let key = RunnerKey::new(symbol, interval);
        return match state.registry.stop(&key).await {
            Ok(stats) => (
                StatusCode::OK,
                Json(serde_json::json!({"success": true, "key": key.to_string(), "stats": stats})),
            ),
            Err(e) => error_json(registry_status(&e), e.to_string()),
        };
    }

    let stopped: Vec<String> = state
        .registry
        .stop_all()
        .await
        .into_iter()
        .map(|(key, _)| key.to_string())
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "stopped": stopped})),
    )
}

fn registry_status(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::NotRunning(_) => StatusCode::NOT_FOUND,
        RegistryError::AlreadyRunning(_) => StatusCode::CONFLICT,
        RegistryError::InvalidConfig { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::Closed(_) => StatusCode::GONE,
        RegistryError::TaskFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Snapshots the history routes read from: one key, or every key
fn history_sources(
    state: &AppState,
    params: &HistoryParams,
) -> Result<(Vec<Arc<RunnerSnapshot>>, usize), (StatusCode, Json<serde_json::Value>)> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let hub = state.registry.broadcaster();
    let snapshots = match params.key.as_deref() {
        Some(raw) => {
            let key = parse_key(raw)?;
            hub.latest(&key).into_iter().collect()
        }
        None => hub.latest_all(),
    };
    Ok((snapshots, limit))
}

/// GET /api/v1/trades[?key=..&limit=..] - recent closed trades, newest first
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let (snapshots, limit) = match history_sources(&state, &params) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let mut merged: Vec<(&RunnerKey, ClosedTrade)> = snapshots
        .iter()
        .flat_map(|s| s.recent_trades(limit).into_iter().map(move |t| (&s.key, t)))
        .collect();
    merged.sort_by(|a, b| b.1.closed_at.cmp(&a.1.closed_at));
    let trades: Vec<serde_json::Value> = merged
        .into_iter()
        .take(limit)
        .map(|(key, trade)| serde_json::json!({"key": key.to_string(), "trade": trade}))
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "count": trades.len(), "trades": trades})),
    )
}

/// GET /api/v1/signals[?key=..&limit=..] - recent breakout signals, newest first
pub async fn get_signals(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let (snapshots, limit) = match history_sources(&state, &params) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let mut merged: Vec<(&RunnerKey, Signal)> = snapshots
        .iter()
        .flat_map(|s| s.recent_signals(limit).into_iter().map(move |sig| (&s.key, sig)))
        .collect();
    merged.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
    let signals: Vec<serde_json::Value> = merged
        .into_iter()
        .take(limit)
        .map(|(key, signal)| serde_json::json!({"key": key.to_string(), "signal": signal}))
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "count": signals.len(), "signals": signals})),
    )
}

/// POST /api/v1/trading/bars/{key} - push bars into a running Runner
pub async fn submit_bars(
    State(state): State<Arc<AppState>>,
    Path(raw_key): Path<String>,
    Json(bars): Json<Vec<Bar>>,
) -> impl IntoResponse {
    let key = match parse_key(&raw_key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let Some(sender) = state.registry.sender(&key).await else {
        return error_json(StatusCode::NOT_FOUND, format!("runner {} is not running", key));
    };

    let total = bars.len();
    for bar in bars {
        if let Err(e) = sender.send(bar).await {
            return error_json(StatusCode::GONE, e.to_string());
        }
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"success": true, "queued": total})),
    )
}

/// GET /ws/live[?key=SYMBOL_interval] - push every snapshot
pub async fn ws_live(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<LiveParams>,
) -> impl IntoResponse {
    let filter = match params.key.as_deref().map(str::parse::<RunnerKey>) {
        Some(Ok(key)) => SubscriptionFilter::Key(key),
        Some(Err(e)) => return error_json(StatusCode::BAD_REQUEST, e).into_response(),
        None => SubscriptionFilter::All,
    };
    ws.on_upgrade(move |socket| handle_live_socket(socket, state, filter))
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &WsMessage,
) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize ws message: {}", e);
            true
        }
    }
}

async fn handle_live_socket(socket: WebSocket, state: Arc<AppState>, filter: SubscriptionFilter) {
    let (mut sender, mut receiver) = socket.split();
    let hub = state.registry.broadcaster();
    // Subscribe before reading the current state so nothing falls in between
    let mut subscription = hub.subscribe(filter.clone());

    let runners: Vec<Arc<RunnerSnapshot>> = hub
        .latest_all()
        .into_iter()
        .filter(|s| filter.matches(&s.key))
        .collect();
    info!("Live client connected ({} runners)", runners.len());
    if !send_json(&mut sender, &WsMessage::Init { runners }).await {
        return;
    }

    loop {
        tokio::select! {
            next = subscription.recv() => {
                let Some(snapshot) = next else { break };
                if !send_json(&mut sender, &WsMessage::Snapshot { snapshot }).await {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                        if !send_json(&mut sender, &WsMessage::Pong).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    info!("Live client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::SnapshotBroadcaster;
    use crate::config::RunnerConfig;
    use crate::execution::RunnerStats;
    use crate::runner::tests::bars;
    use crate::runner::Runner;

    fn state(symbols: &[&str]) -> Arc<AppState> {
        let hub = Arc::new(SnapshotBroadcaster::default());
        Arc::new(AppState {
            registry: RunnerRegistry::with_default_config(hub, RunnerConfig::seeded(9)),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            replay_file: None,
            replay_pace: Duration::ZERO,
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_start_all_reports_each_symbol() {
        let state = state(&["BTCUSDT", "ETHUSDT"]);
        let btc = RunnerKey::new("BTCUSDT", "5m");
        state.registry.start(btc.clone(), None).await.unwrap();

        let params = StartAllParams {
            interval: Some("5m".to_string()),
        };
        let response = start_all_trading(State(Arc::clone(&state)), Query(params))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["interval"], "5m");
        assert_eq!(body["results"]["BTCUSDT"]["status"], "already_running");
        assert_eq!(body["results"]["ETHUSDT"]["status"], "started");
        assert!(state.registry.is_running(&RunnerKey::new("ETHUSDT", "5m")).await);

        state.registry.stop_all().await;
    }

    #[test]
    fn test_registry_error_statuses() {
        let key = RunnerKey::new("BTCUSDT", "1m");
        assert_eq!(
            registry_status(&RegistryError::NotRunning(key.clone())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            registry_status(&RegistryError::TaskFailed(key)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_key_is_not_found() {
        let state = state(&["BTCUSDT"]);
        let params = TradingParams {
            symbol: Some("BTCUSDT".to_string()),
            interval: Some("1m".to_string()),
        };
        let response = stop_trading(State(state), Query(params)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trades_route_respects_limit() {
        let state = state(&["BTCUSDT"]);
        let key = RunnerKey::new("BTCUSDT", "1m");
        let mut runner = Runner::new(key.clone(), RunnerConfig::seeded(2)).unwrap();
        for bar in bars(3) {
            // Stop is always inside the bar, so each bar closes one trade
            let mut stats: RunnerStats = runner.stats().clone();
            stats.current_position = Some(crate::execution::Position {
                direction: crate::types::Direction::Long,
                entry_price: bar.close,
                stop_loss: bar.low + 0.01,
                take_profit: bar.high + 100.0,
                opened_at: bar.timestamp - chrono::Duration::seconds(1),
                bars_held: 0,
                entry_confidence: 0.7,
            });
            runner.restore_stats(stats);
            let snapshot = runner.process_bar(bar).unwrap();
            state.registry.broadcaster().publish(snapshot);
        }

        let params = HistoryParams {
            key: Some(key.to_string()),
            limit: Some(2),
        };
        let response = get_trades(State(Arc::clone(&state)), Query(params))
            .await
            .into_response();
        let body = body_json(response).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["trades"][0]["key"], "BTCUSDT_1m");
        assert_eq!(body["trades"][0]["trade"]["reason"], "stop_loss");

        let params = HistoryParams {
            key: Some("garbage".to_string()),
            limit: None,
        };
        let response = get_trades(State(state), Query(params)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
