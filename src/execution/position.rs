//! Paper position tracking and running P&L
//!
//! One position at most. Each bar triggers at most one transition, checked in
//! priority order: stop/target, max hold, opposing signal, new entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TradingConfig;
use crate::engines::Signal;
use crate::types::{Bar, Direction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    /// Bars evaluated since the opening bar
    pub bars_held: usize,
    pub entry_confidence: f64,
}

impl Position {
    /// Profit per unit if closed at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        match self.direction {
            Direction::Long => price - self.entry_price,
            Direction::Short => self.entry_price - price,
        }
    }

    fn stop_hit(&self, bar: &Bar) -> bool {
        match self.direction {
            Direction::Long => bar.low <= self.stop_loss,
            Direction::Short => bar.high >= self.stop_loss,
        }
    }

    fn target_hit(&self, bar: &Bar) -> bool {
        match self.direction {
            Direction::Long => bar.high >= self.take_profit,
            Direction::Short => bar.low <= self.take_profit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxHold,
    OpposingSignal,
    /// Trading stopped while the position was open
    Shutdown,
}

impl ExitReason {
    fn label(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP",
            ExitReason::TakeProfit => "TARGET",
            ExitReason::MaxHold => "TIMEOUT",
            ExitReason::OpposingSignal => "REVERSAL",
            ExitReason::Shutdown => "SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: Uuid,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub bars_held: usize,
    pub pnl: f64,
    pub reason: ExitReason,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl >= 0.0
    }
}

/// Running statistics for one Runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStats {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    /// Realized profit per unit, summed over closed trades
    pub total_pnl: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub max_drawdown: f64,
    /// Breakout signals seen, acted on or not
    pub signals_generated: u64,
    pub current_position: Option<Position>,
}

impl RunnerStats {
    pub fn new(starting_equity: f64) -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: 0.0,
            equity: starting_equity,
            peak_equity: starting_equity,
            max_drawdown: 0.0,
            signals_generated: 0,
            current_position: None,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.winning_trades as f64 / self.total_trades as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Equity: {:.2} | P&L: {:+.4} | Trades: {} | WR: {:.1}% | MaxDD: {:.4}",
            self.equity,
            self.total_pnl,
            self.total_trades,
            self.win_rate() * 100.0,
            self.max_drawdown
        )
    }

    fn record(&mut self, trade: &ClosedTrade) {
        self.total_trades += 1;
        if trade.is_win() {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }
        self.total_pnl += trade.pnl;
        self.equity += trade.pnl;
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        let drawdown = self.peak_equity - self.equity;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }
}

/// What a bar did to the position
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Nothing,
    Opened(Position),
    Closed(ClosedTrade),
}

#[derive(Debug, Clone)]
pub struct PositionTracker {
    config: TradingConfig,
    stats: RunnerStats,
}

impl PositionTracker {
    pub fn new(config: TradingConfig) -> Self {
        let stats = RunnerStats::new(config.starting_equity);
        Self { config, stats }
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    pub fn position(&self) -> Option<&Position> {
        self.stats.current_position.as_ref()
    }

    pub fn is_flat(&self) -> bool {
        self.stats.current_position.is_none()
    }

    /// Replace the running statistics, including any open position.
    pub fn restore(&mut self, stats: RunnerStats) {
        self.stats = stats;
    }

    /// Apply one bar and the signal computed from it.
    pub fn on_bar(&mut self, bar: &Bar, signal: Option<&Signal>) -> Transition {
        if signal.is_some_and(Signal::is_breakout) {
            self.stats.signals_generated += 1;
        }

        if let Some(pos) = self.stats.current_position.as_mut() {
            pos.bars_held += 1;

            let exit = if pos.stop_hit(bar) {
                Some((pos.stop_loss, ExitReason::StopLoss))
            } else if pos.target_hit(bar) {
                Some((pos.take_profit, ExitReason::TakeProfit))
            } else if pos.bars_held >= self.config.max_hold_bars {
                Some((bar.close, ExitReason::MaxHold))
            } else if self.config.close_on_opposing_signal
                && signal.is_some_and(|s| {
                    s.signal_type.direction() == Some(pos.direction.opposite())
                        && s.confidence >= self.config.min_reversal_confidence
                })
            {
                Some((bar.close, ExitReason::OpposingSignal))
            } else {
                None
            };

            let closed = exit.and_then(|(price, reason)| self.close(price, bar.timestamp, reason));
            return match closed {
                Some(trade) => Transition::Closed(trade),
                None => Transition::Nothing,
            };
        }

        let Some(signal) = signal else {
            return Transition::Nothing;
        };
        let Some(direction) = signal.signal_type.direction() else {
            return Transition::Nothing;
        };
        if signal.confidence < self.config.min_confidence {
            debug!(
                "Skipping {} signal: confidence {:.2} < {:.2}",
                direction, signal.confidence, self.config.min_confidence
            );
            return Transition::Nothing;
        }

        let entry_price = bar.close;
        let stop_offset = entry_price * self.config.stop_loss_pct / 100.0;
        let target_offset = entry_price * self.config.take_profit_pct / 100.0;
        let (stop_loss, take_profit) = match direction {
            Direction::Long => (entry_price - stop_offset, entry_price + target_offset),
            Direction::Short => (entry_price + stop_offset, entry_price - target_offset),
        };

        let position = Position {
            direction,
            entry_price,
            stop_loss,
            take_profit,
            opened_at: bar.timestamp,
            bars_held: 0,
            entry_confidence: signal.confidence,
        };
        info!(
            "ENTRY: {} @ {:.4} | Stop: {:.4} | Target: {:.4} | Conf: {:.2}",
            direction, entry_price, stop_loss, take_profit, signal.confidence
        );
        self.stats.current_position = Some(position.clone());
        Transition::Opened(position)
    }

    /// Close any open position at `price` with reason `Shutdown`.
    pub fn force_close(&mut self, price: f64, time: DateTime<Utc>) -> Option<ClosedTrade> {
        self.close(price, time, ExitReason::Shutdown)
    }

    fn close(
        &mut self,
        price: f64,
        time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Option<ClosedTrade> {
        let pos = self.stats.current_position.take()?;
        let pnl = pos.pnl_at(price);
        let trade = ClosedTrade {
            id: Uuid::new_v4(),
            direction: pos.direction,
            entry_price: pos.entry_price,
            exit_price: price,
            opened_at: pos.opened_at,
            closed_at: time,
            bars_held: pos.bars_held,
            pnl,
            reason,
        };
        self.stats.record(&trade);

        info!(
            "EXIT {}: {} @ {:.4} | P&L: {:+.4} | {}",
            reason.label(),
            pos.direction,
            price,
            pnl,
            if trade.is_win() { "WIN" } else { "LOSS" }
        );
        Some(trade)
    }
}
