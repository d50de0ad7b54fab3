//! Signals Engine - turns a predictive snapshot into one discrete signal
//!
//! Decision order, first match wins:
//! 1. up-breakout probability at threshold with IFI rising -> `BreakoutLong`
//! 2. down-breakout probability at threshold with IFI rising -> `BreakoutShort`
//! 3. otherwise `NeutralWatch`
//!
//! An optional cumulative-delta trend can veto or re-weight breakouts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::predictive::PredictiveSnapshot;
use crate::config::SignalsConfig;
use crate::types::{Bar, Direction};

/// Delta/volume ratio below which order flow is considered balanced.
const TREND_BIAS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    BreakoutLong,
    BreakoutShort,
    NeutralWatch,
}

impl SignalType {
    /// Trade direction of a breakout; `None` for neutral.
    pub fn direction(self) -> Option<Direction> {
        match self {
            SignalType::BreakoutLong => Some(Direction::Long),
            SignalType::BreakoutShort => Some(Direction::Short),
            SignalType::NeutralWatch => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub timestamp: Option<DateTime<Utc>>,
    pub confidence: f64,
    pub breakout_probability: f64,
    pub ifi: f64,
    pub energy_collapse_risk: f64,
    pub description: Option<String>,
}

impl Signal {
    pub fn is_breakout(&self) -> bool {
        self.signal_type != SignalType::NeutralWatch
    }
}

/// IFI movement relative to the previous snapshot of the same Runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfiTrend {
    Rising,
    Falling,
    /// No previous snapshot
    Unknown,
}

impl IfiTrend {
    /// Rising only when a previous value exists and the current one is larger.
    pub fn between(previous: Option<f64>, current: f64) -> Self {
        match previous {
            Some(prev) if current > prev => IfiTrend::Rising,
            Some(_) => IfiTrend::Falling,
            None => IfiTrend::Unknown,
        }
    }

    pub fn is_rising(self) -> bool {
        self == IfiTrend::Rising
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

/// Cumulative order-flow trend over a lookback window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaTrend {
    pub bias: TrendBias,
    /// 0.0 - 1.0
    pub strength: f64,
}

impl DeltaTrend {
    pub const NEUTRAL: DeltaTrend = DeltaTrend {
        bias: TrendBias::Neutral,
        strength: 0.0,
    };

    /// Sum delta and volume over the last `lookback` bars. Bars without
    /// order-flow data contribute volume only.
    pub fn from_bars(bars: &[Bar], lookback: usize, delta_threshold: f64) -> Self {
        let recent = &bars[bars.len().saturating_sub(lookback)..];
        if recent.len() < 3 {
            return Self::NEUTRAL;
        }

        let cumulative_delta: f64 = recent.iter().filter_map(Bar::order_flow_delta).sum();
        let total_volume: f64 = recent.iter().map(|b| b.volume).sum();
        if total_volume <= 0.0 {
            return Self::NEUTRAL;
        }

        let ratio = cumulative_delta.abs() / total_volume;
        let strength = (ratio / delta_threshold).min(1.0);
        let bias = if ratio > TREND_BIAS && cumulative_delta > 0.0 {
            TrendBias::Bullish
        } else if ratio > TREND_BIAS && cumulative_delta < 0.0 {
            TrendBias::Bearish
        } else {
            TrendBias::Neutral
        };
        Self { bias, strength }
    }

    fn supports(&self, direction: Direction) -> bool {
        matches!(
            (self.bias, direction),
            (TrendBias::Bullish, Direction::Long) | (TrendBias::Bearish, Direction::Short)
        )
    }

    fn opposes(&self, direction: Direction) -> bool {
        matches!(
            (self.bias, direction),
            (TrendBias::Bearish, Direction::Long) | (TrendBias::Bullish, Direction::Short)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SignalsEngine {
    config: SignalsConfig,
}

impl SignalsEngine {
    pub fn new(config: SignalsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalsConfig {
        &self.config
    }

    /// Produce exactly one signal. `delta_trend` is only consulted when the
    /// delta filter is enabled.
    pub fn compute(
        &self,
        predictive: &PredictiveSnapshot,
        ifi_trend: IfiTrend,
        delta_trend: Option<DeltaTrend>,
    ) -> Signal {
        let trend = if self.config.delta_filter { delta_trend } else { None };
        let p_up = predictive.breakout_probability_up;
        let p_down = predictive.breakout_probability_down;

        let candidates = [(Direction::Long, p_up), (Direction::Short, p_down)];
        for (direction, probability) in candidates {
            if let Some(signal) =
                self.breakout(predictive, ifi_trend, trend, direction, probability)
            {
                return signal;
            }
        }

        let max_bp = p_up.max(p_down);
        Signal {
            signal_type: SignalType::NeutralWatch,
            timestamp: predictive.timestamp,
            confidence: (1.0 - max_bp).clamp(0.0, 1.0),
            breakout_probability: max_bp,
            ifi: predictive.ifi,
            energy_collapse_risk: predictive.energy_collapse_risk,
            description: Some(match trend {
                Some(t) => format!(
                    "Neutral. Delta trend: {:?} ({:.0}%)",
                    t.bias,
                    t.strength * 100.0
                ),
                None => "Neutral".to_string(),
            }),
        }
    }

    fn breakout(
        &self,
        predictive: &PredictiveSnapshot,
        ifi_trend: IfiTrend,
        trend: Option<DeltaTrend>,
        direction: Direction,
        probability: f64,
    ) -> Option<Signal> {
        let threshold = self.config.breakout_threshold;
        if probability < threshold || !ifi_trend.is_rising() {
            return None;
        }

        let base = 0.5 + (probability - threshold);
        let (confidence, description) = match trend {
            Some(t) if t.opposes(direction) && t.strength >= self.config.block_strength => {
                return None
            }
            Some(t)
                if t.bias != TrendBias::Neutral && t.strength < self.config.min_delta_strength =>
            {
                return None
            }
            Some(t) if t.supports(direction) => (
                base + t.strength * 0.25,
                format!(
                    "{}: bp={:.0}%, IFI rising, delta confirms ({:.0}%)",
                    direction,
                    probability * 100.0,
                    t.strength * 100.0
                ),
            ),
            Some(t) if t.opposes(direction) => (
                base - t.strength * 0.5,
                format!(
                    "{} WEAK: bp={:.0}%, delta against ({:.0}%)",
                    direction,
                    probability * 100.0,
                    t.strength * 100.0
                ),
            ),
            _ => (
                base,
                format!("{}: bp={:.0}%, IFI rising", direction, probability * 100.0),
            ),
        };

        Some(Signal {
            signal_type: match direction {
                Direction::Long => SignalType::BreakoutLong,
                Direction::Short => SignalType::BreakoutShort,
            },
            timestamp: predictive.timestamp,
            confidence: confidence.clamp(0.0, 1.0),
            breakout_probability: probability,
            ifi: predictive.ifi,
            energy_collapse_risk: predictive.energy_collapse_risk,
            description: Some(description),
        })
    }
}

impl Default for SignalsEngine {
    fn default() -> Self {
        Self::new(SignalsConfig::default())
    }
}
