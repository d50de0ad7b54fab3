//! Predictive Engine - Monte Carlo breakout forecast
//!
//! Simulates `num_scenarios` random walks of `horizon_bars` steps from the
//! last close, with per-step volatility taken from the window's returns, and
//! measures how often they break beyond an ATR band around the recent range.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::topology::trailing;
use crate::config::PredictiveConfig;
use crate::types::Bar;

/// Below this many bars there are not enough returns for a sample deviation.
const MIN_PREDICTIVE_BARS: usize = 3;
const MIN_ATR: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveSnapshot {
    pub timestamp: Option<DateTime<Utc>>,
    pub horizon_bars: usize,
    pub num_scenarios: usize,
    /// Implied Forecast Intensity: mean cross-scenario std in basis points of price
    pub ifi: f64,
    pub breakout_probability_up: f64,
    pub breakout_probability_down: f64,
    /// Fraction of scenarios that touched neither breakout level
    pub energy_collapse_risk: f64,
    pub breakout_level_up: f64,
    pub breakout_level_down: f64,
    pub cone_upper: Vec<f64>,
    pub cone_lower: Vec<f64>,
}

/// Which level a simulated path reached first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Up,
    Down,
    Neither,
}

#[derive(Debug, Clone)]
pub struct PredictiveEngine {
    config: PredictiveConfig,
}

impl PredictiveEngine {
    pub fn new(config: PredictiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.config
    }

    /// Uses the configured seed if any, otherwise OS entropy.
    pub fn compute(&self, bars: &[Bar]) -> PredictiveSnapshot {
        match self.config.seed {
            Some(seed) => self.compute_seeded(bars, seed),
            None => self.compute_with_rng(bars, &mut StdRng::from_entropy()),
        }
    }

    pub fn compute_seeded(&self, bars: &[Bar], seed: u64) -> PredictiveSnapshot {
        self.compute_with_rng(bars, &mut StdRng::seed_from_u64(seed))
    }

    pub fn compute_with_rng<R: Rng>(&self, bars: &[Bar], rng: &mut R) -> PredictiveSnapshot {
        let window = trailing(bars, self.config.window_size);
        let horizon = self.config.horizon_bars;
        let scenarios = self.config.num_scenarios;

        let last_close = window.last().map(|b| b.close).unwrap_or(0.0);
        let timestamp = window.last().map(|b| b.timestamp);

        if window.len() < MIN_PREDICTIVE_BARS {
            return PredictiveSnapshot {
                timestamp,
                horizon_bars: horizon,
                num_scenarios: scenarios,
                ifi: 0.0,
                breakout_probability_up: 0.0,
                breakout_probability_down: 0.0,
                energy_collapse_risk: 0.0,
                breakout_level_up: last_close,
                breakout_level_down: last_close,
                cone_upper: vec![last_close; horizon],
                cone_lower: vec![last_close; horizon],
            };
        }

        let returns: Vec<f64> = window
            .windows(2)
            .map(|pair| {
                let prev = pair[0].close;
                if prev == 0.0 { 0.0 } else { (pair[1].close - prev) / prev.abs() }
            })
            .collect();
        let sigma = sample_std(&returns);

        let recent = trailing(window, self.config.atr_period);
        let atr = average_true_range(window, recent.len()).max(MIN_ATR);
        let recent_high = recent.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let recent_low = recent.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let level_up = recent_high + self.config.breakout_atr_mult * atr;
        let level_down = recent_low - self.config.breakout_atr_mult * atr;

        // paths[scenario][step]
        let mut paths = Vec::with_capacity(scenarios);
        let mut touches = Vec::with_capacity(scenarios);
        for _ in 0..scenarios {
            let mut price = last_close;
            let mut touch = Touch::Neither;
            let mut path = Vec::with_capacity(horizon);
            for _ in 0..horizon {
                let z: f64 = StandardNormal.sample(&mut *rng);
                price *= 1.0 + sigma * z;
                if touch == Touch::Neither {
                    if price >= level_up {
                        touch = Touch::Up;
                    } else if price <= level_down {
                        touch = Touch::Down;
                    }
                }
                path.push(price);
            }
            paths.push(path);
            touches.push(touch);
        }

        let mut cone_upper = Vec::with_capacity(horizon);
        let mut cone_lower = Vec::with_capacity(horizon);
        let mut step_std_sum = 0.0;
        for step in 0..horizon {
            let values: Vec<f64> = paths.iter().map(|p| p[step]).collect();
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let std = sample_std(&values);
            step_std_sum += std;
            cone_upper.push(mean + std);
            cone_lower.push(mean - std);
        }

        let fraction = |kind: Touch| {
            touches.iter().filter(|t| **t == kind).count() as f64 / scenarios as f64
        };

        let mean_std = step_std_sum / horizon as f64;
        let ifi = if last_close == 0.0 {
            0.0
        } else {
            (mean_std / last_close.abs() * 10_000.0).max(0.0)
        };

        PredictiveSnapshot {
            timestamp,
            horizon_bars: horizon,
            num_scenarios: scenarios,
            ifi,
            breakout_probability_up: fraction(Touch::Up),
            breakout_probability_down: fraction(Touch::Down),
            energy_collapse_risk: fraction(Touch::Neither),
            breakout_level_up: level_up,
            breakout_level_down: level_down,
            cone_upper,
            cone_lower,
        }
    }
}

impl Default for PredictiveEngine {
    fn default() -> Self {
        Self::new(PredictiveConfig::default())
    }
}

/// Sample standard deviation (n - 1); zero for fewer than two values.
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Simple mean of the true range over the last `period` bars of `bars`.
/// The previous close is used whenever the bar before is available.
fn average_true_range(bars: &[Bar], period: usize) -> f64 {
    let start = bars.len().saturating_sub(period);
    let ranges: Vec<f64> = (start..bars.len())
        .map(|i| {
            let bar = &bars[i];
            let range = bar.high - bar.low;
            match i.checked_sub(1).map(|p| bars[p].close) {
                Some(prev_close) => range
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs()),
                None => range,
            }
        })
        .collect();
    if ranges.is_empty() {
        0.0
    } else {
        ranges.iter().sum::<f64>() / ranges.len() as f64
    }
}
