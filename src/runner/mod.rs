//! Per-(instrument, timeframe) Runner
//!
//! `Runner` is the synchronous state machine: one bar in, one snapshot out.
//! `spawn_runner` drives it from a tokio task fed by a bounded bar queue and
//! publishes every snapshot to the broadcaster.

pub mod registry;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::SnapshotBroadcaster;
use crate::config::RunnerConfig;
use crate::engines::{
    DeltaTrend, IfiTrend, PredictiveEngine, PredictiveSnapshot, Signal, SignalsEngine,
    TopologyEngine, TopologySnapshot,
};
use crate::error::{BarError, ConfigError, RegistryError};
use crate::execution::{ClosedTrade, PositionTracker, RunnerStats, Transition};
use crate::types::{Bar, RunnerKey};

pub use registry::RunnerRegistry;

/// Everything derived from one bar. Built once, never mutated after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSnapshot {
    pub key: RunnerKey,
    pub bar: Bar,
    pub topology: TopologySnapshot,
    pub predictive: PredictiveSnapshot,
    /// `None` during warmup
    pub signal: Option<Signal>,
    pub stats: RunnerStats,
    pub bars_processed: u64,
    /// Most recent closed trade, if any
    pub last_trade: Option<ClosedTrade>,
    /// Closed trades, oldest first, capped at `history_capacity`
    #[serde(skip)]
    pub trade_history: Arc<VecDeque<ClosedTrade>>,
    /// Breakout signals, oldest first, capped at `history_capacity`
    #[serde(skip)]
    pub signal_history: Arc<VecDeque<Signal>>,
}

impl RunnerSnapshot {
    /// Up to `limit` closed trades, newest first
    pub fn recent_trades(&self, limit: usize) -> Vec<ClosedTrade> {
        self.trade_history.iter().rev().take(limit).cloned().collect()
    }

    /// Up to `limit` breakout signals, newest first
    pub fn recent_signals(&self, limit: usize) -> Vec<Signal> {
        self.signal_history.iter().rev().take(limit).cloned().collect()
    }
}

/// Append to a shared history, copying only if a published snapshot still
/// holds the previous version.
fn push_bounded<T: Clone>(history: &mut Arc<VecDeque<T>>, item: T, capacity: usize) {
    let history = Arc::make_mut(history);
    history.push_back(item);
    while history.len() > capacity {
        history.pop_front();
    }
}

pub struct Runner {
    key: RunnerKey,
    config: RunnerConfig,
    topology: TopologyEngine,
    predictive: PredictiveEngine,
    signals: SignalsEngine,
    tracker: PositionTracker,
    window: VecDeque<Bar>,
    history_len: usize,
    rng: StdRng,
    prev_ifi: Option<f64>,
    last_timestamp: Option<DateTime<Utc>>,
    bars_processed: u64,
    last_trade: Option<ClosedTrade>,
    trade_history: Arc<VecDeque<ClosedTrade>>,
    signal_history: Arc<VecDeque<Signal>>,
    last_snapshot: Option<Arc<RunnerSnapshot>>,
}

impl Runner {
    pub fn new(key: RunnerKey, config: RunnerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let history_len = config.history_len();
        // One generator per Runner so a seeded replay reproduces the whole stream
        let rng = match config.predictive.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            key,
            topology: TopologyEngine::new(config.topology.clone()),
            predictive: PredictiveEngine::new(config.predictive.clone()),
            signals: SignalsEngine::new(config.signals.clone()),
            tracker: PositionTracker::new(config.trading.clone()),
            window: VecDeque::with_capacity(history_len + 1),
            history_len,
            rng,
            prev_ifi: None,
            last_timestamp: None,
            bars_processed: 0,
            last_trade: None,
            trade_history: Arc::default(),
            signal_history: Arc::default(),
            last_snapshot: None,
            config,
        })
    }

    pub fn key(&self) -> &RunnerKey {
        &self.key
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn stats(&self) -> &RunnerStats {
        self.tracker.stats()
    }

    pub fn bars_processed(&self) -> u64 {
        self.bars_processed
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn last_snapshot(&self) -> Option<&Arc<RunnerSnapshot>> {
        self.last_snapshot.as_ref()
    }

    pub fn trade_history(&self) -> &VecDeque<ClosedTrade> {
        &self.trade_history
    }

    pub fn signal_history(&self) -> &VecDeque<Signal> {
        &self.signal_history
    }

    /// Seed the running statistics from an external store. Intended to be
    /// called before the first bar.
    pub fn restore_stats(&mut self, stats: RunnerStats) {
        info!("{} restored stats: {}", self.key, stats.summary());
        self.tracker.restore(stats);
    }

    /// Run the full pipeline on one bar. A rejected bar leaves every piece
    /// of state untouched.
    pub fn process_bar(&mut self, bar: Bar) -> Result<Arc<RunnerSnapshot>, BarError> {
        bar.validate()?;
        if let Some(last) = self.last_timestamp {
            if bar.timestamp <= last {
                return Err(BarError::OutOfOrder {
                    timestamp: bar.timestamp,
                    last,
                });
            }
        }

        self.last_timestamp = Some(bar.timestamp);
        self.bars_processed += 1;
        self.window.push_back(bar.clone());
        while self.window.len() > self.history_len {
            self.window.pop_front();
        }

        let bars: &[Bar] = self.window.make_contiguous();
        let topology = self.topology.compute(bars);
        let predictive = self.predictive.compute_with_rng(bars, &mut self.rng);

        let ifi_trend = IfiTrend::between(self.prev_ifi, predictive.ifi);
        self.prev_ifi = Some(predictive.ifi);

        let signal = if self.bars_processed >= self.config.warmup_bars as u64 {
            let delta_trend = self.config.signals.delta_filter.then(|| {
                DeltaTrend::from_bars(
                    bars,
                    self.config.signals.delta_lookback,
                    self.config.signals.delta_threshold,
                )
            });
            Some(self.signals.compute(&predictive, ifi_trend, delta_trend))
        } else {
            None
        };

        if let Some(s) = signal.as_ref().filter(|s| s.is_breakout()) {
            info!(
                "SIGNAL {}: {:?} @ {:.4} | Conf: {:.2} | IFI: {:.2}",
                self.key, s.signal_type, bar.close, s.confidence, s.ifi
            );
            push_bounded(&mut self.signal_history, s.clone(), self.config.history_capacity);
        }

        if let Transition::Closed(trade) = self.tracker.on_bar(&bar, signal.as_ref()) {
            push_bounded(&mut self.trade_history, trade.clone(), self.config.history_capacity);
            self.last_trade = Some(trade);
        }

        debug!(
            "{} bar #{} close={:.4} coherence={:.4} vortexes={} ifi={:.2}",
            self.key,
            self.bars_processed,
            bar.close,
            topology.coherence,
            topology.vortexes.len(),
            predictive.ifi
        );

        let snapshot = Arc::new(RunnerSnapshot {
            key: self.key.clone(),
            bar,
            topology,
            predictive,
            signal,
            stats: self.tracker.stats().clone(),
            bars_processed: self.bars_processed,
            last_trade: self.last_trade.clone(),
            trade_history: Arc::clone(&self.trade_history),
            signal_history: Arc::clone(&self.signal_history),
        });
        self.last_snapshot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Force-close any open position at the last close and return the final
    /// snapshot. `None` if no bar was ever processed.
    pub fn shutdown(&mut self) -> Option<Arc<RunnerSnapshot>> {
        let last = self.last_snapshot.as_ref()?;
        let Some(trade) = self.tracker.force_close(last.bar.close, last.bar.timestamp) else {
            return Some(Arc::clone(last));
        };

        let mut final_snapshot = RunnerSnapshot::clone(last);
        final_snapshot.signal = None;
        final_snapshot.stats = self.tracker.stats().clone();
        final_snapshot.last_trade = Some(trade.clone());
        push_bounded(&mut self.trade_history, trade.clone(), self.config.history_capacity);
        final_snapshot.trade_history = Arc::clone(&self.trade_history);
        self.last_trade = Some(trade);

        let final_snapshot = Arc::new(final_snapshot);
        self.last_snapshot = Some(Arc::clone(&final_snapshot));
        Some(final_snapshot)
    }
}

/// Cloneable ingestion end of a running Runner
#[derive(Debug, Clone)]
pub struct BarSender {
    key: RunnerKey,
    tx: mpsc::Sender<Bar>,
}

impl BarSender {
    pub fn key(&self) -> &RunnerKey {
        &self.key
    }

    /// Queue a bar, waiting while the queue is full.
    pub async fn send(&self, bar: Bar) -> Result<(), RegistryError> {
        self.tx
            .send(bar)
            .await
            .map_err(|_| RegistryError::Closed(self.key.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct RunnerHandle {
    key: RunnerKey,
    bars: BarSender,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<RunnerStats>,
}

impl RunnerHandle {
    pub fn key(&self) -> &RunnerKey {
        &self.key
    }

    pub fn sender(&self) -> BarSender {
        self.bars.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal stop and wait for the task. The bar being processed, if any,
    /// completes first; queued bars behind it are discarded.
    pub async fn stop(self) -> Result<RunnerStats, RegistryError> {
        // Err means the task already exited
        let _ = self.stop_tx.send(());
        self.task
            .await
            .map_err(|_| RegistryError::TaskFailed(self.key.clone()))
    }
}

/// Move `runner` onto its own task.
pub fn spawn_runner(runner: Runner, broadcaster: Arc<SnapshotBroadcaster>) -> RunnerHandle {
    let key = runner.key().clone();
    let (tx, rx) = mpsc::channel(runner.config().channel_capacity);
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run(runner, rx, stop_rx, broadcaster));

    RunnerHandle {
        bars: BarSender { key: key.clone(), tx },
        key,
        stop_tx,
        task,
    }
}

async fn run(
    mut runner: Runner,
    mut rx: mpsc::Receiver<Bar>,
    mut stop_rx: oneshot::Receiver<()>,
    broadcaster: Arc<SnapshotBroadcaster>,
) -> RunnerStats {
    info!("RUNNER START: {}", runner.key());

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            next = rx.recv() => {
                let Some(bar) = next else { break };
                let timestamp = bar.timestamp;
                match runner.process_bar(bar) {
                    Ok(snapshot) => {
                        broadcaster.publish(snapshot);
                    }
                    Err(e) => warn!("{} dropped bar at {}: {}", runner.key(), timestamp, e),
                }
            }
        }
    }

    if let Some(final_snapshot) = runner.shutdown() {
        broadcaster.publish(final_snapshot);
    }
    info!("RUNNER STOP: {} | {}", runner.key(), runner.stats().summary());
    runner.stats().clone()
}
