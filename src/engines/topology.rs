//! Topology Engine - rotation and energy of the (return, order flow) plane
//!
//! Every bar is mapped to a 2D vector `(normalized return, delta / volume)`.
//! The signed sine of the angle between consecutive vectors measures how
//! sharply price and flow turn together; combined with the bar's energy
//! (|return| x volume) it flags vortexes, points where direction is likely
//! to inflect.
//!
//! The engine keeps no state between calls: the same window always yields
//! the same snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TopologyConfig;
use crate::types::Bar;

/// Fewest bars that contain one rotation (three consecutive vectors).
const MIN_TOPOLOGY_BARS: usize = 3;

/// Sense of rotation at a vortex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VortexDirection {
    Clockwise,
    CounterClockwise,
}

/// A detected high-rotation, high-energy bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VortexMarker {
    /// Position of the bar inside the analysed window
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    /// |rotation|, in [0, 1]
    pub strength: f64,
    pub direction: VortexDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub timestamp: Option<DateTime<Utc>>,
    /// Mean |rotation| over the window
    pub coherence: f64,
    /// Energy of the most recent bar pair
    pub energy: f64,
    pub vortexes: Vec<VortexMarker>,
}

impl TopologySnapshot {
    fn neutral(timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            timestamp,
            coherence: 0.0,
            energy: 0.0,
            vortexes: Vec::new(),
        }
    }
}

/// Per-bar intermediate values, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationPoint {
    pub index: usize,
    pub rotation: f64,
    pub energy: f64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct TopologyEngine {
    config: TopologyConfig,
}

impl TopologyEngine {
    pub fn new(config: TopologyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Compute a snapshot over the trailing `window_size` bars.
    pub fn compute(&self, bars: &[Bar]) -> TopologySnapshot {
        let window = trailing(bars, self.config.window_size);
        let timestamp = window.last().map(|b| b.timestamp);

        let points = self.rotation_series(window);
        if points.is_empty() {
            return TopologySnapshot::neutral(timestamp);
        }

        let coherence = points.iter().map(|p| p.rotation.abs()).sum::<f64>() / points.len() as f64;

        let mut energies: Vec<f64> = points.iter().map(|p| p.energy).collect();
        energies.sort_by(f64::total_cmp);
        let energy_gate = percentile_sorted(&energies, self.config.vortex_energy_percentile);

        let vortexes = points
            .iter()
            .filter(|p| p.score >= self.config.vortex_threshold && p.energy >= energy_gate)
            .map(|p| {
                let bar = &window[p.index];
                VortexMarker {
                    index: p.index,
                    timestamp: bar.timestamp,
                    price: bar.close,
                    strength: p.rotation.abs(),
                    direction: if p.rotation > 0.0 {
                        VortexDirection::CounterClockwise
                    } else {
                        VortexDirection::Clockwise
                    },
                }
            })
            .collect();

        TopologySnapshot {
            timestamp,
            coherence,
            energy: points.last().map(|p| p.energy).unwrap_or(0.0),
            vortexes,
        }
    }

    /// Rotation, energy and composite score for every interior bar
    /// (`1 <= k <= len - 2`) of `window`. Empty below three bars.
    pub fn rotation_series(&self, window: &[Bar]) -> Vec<RotationPoint> {
        if window.len() < MIN_TOPOLOGY_BARS {
            return Vec::new();
        }

        let vectors: Vec<(f64, f64)> = window
            .iter()
            .enumerate()
            .map(|(i, bar)| {
                let ret = if i == 0 {
                    0.0
                } else {
                    normalized_return(window[i - 1].close, bar.close)
                };
                (ret, normalized_flow(bar))
            })
            .collect();

        let mut points: Vec<RotationPoint> = (1..window.len() - 1)
            .map(|k| RotationPoint {
                index: k,
                rotation: rotation(vectors[k - 1], vectors[k], self.config.epsilon),
                energy: vectors[k].0.abs() * window[k].volume,
                score: 0.0,
            })
            .collect();

        let mut sorted: Vec<f64> = points.iter().map(|p| p.energy).collect();
        sorted.sort_by(f64::total_cmp);
        let median = sorted[sorted.len() / 2];

        for point in &mut points {
            point.score = if median > 0.0 {
                point.rotation.abs() * (point.energy / median).sqrt()
            } else {
                0.0
            };
        }
        points
    }
}

impl Default for TopologyEngine {
    fn default() -> Self {
        Self::new(TopologyConfig::default())
    }
}

pub(crate) fn trailing(bars: &[Bar], window_size: usize) -> &[Bar] {
    &bars[bars.len().saturating_sub(window_size)..]
}

fn normalized_return(prev_close: f64, close: f64) -> f64 {
    if prev_close == 0.0 {
        0.0
    } else {
        (close - prev_close) / prev_close.abs()
    }
}

fn normalized_flow(bar: &Bar) -> f64 {
    match bar.order_flow_delta() {
        Some(delta) if bar.volume > 0.0 => delta / bar.volume,
        _ => 0.0,
    }
}

/// Sine of the angle from `prev` to `curr`, in [-1, 1].
fn rotation(prev: (f64, f64), curr: (f64, f64), epsilon: f64) -> f64 {
    let cross = prev.0 * curr.1 - prev.1 * curr.0;
    let denom = prev.0.hypot(prev.1) * curr.0.hypot(curr.1);
    if denom < epsilon {
        0.0
    } else {
        (cross / denom).clamp(-1.0, 1.0)
    }
}

fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    let idx = ((pct * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn bar(i: i64, close: f64, volume: f64, delta: f64) -> Bar {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 9, 30, 0).unwrap() + Duration::minutes(i);
        let mut bar = Bar::new(ts, close, close + 0.1, close - 0.1, close, volume);
        bar.delta = Some(delta);
        bar
    }

    /// Steady drift, one sharp up/down reversal with heavy opposing flow,
    /// then steady drift again. The reversal sits at indices 20 and 21.
    fn reversal_window() -> Vec<Bar> {
        let mut bars = Vec::new();
        let mut price = 100.0;
        let mut i = 0;
        for _ in 0..20 {
            price += 0.05;
            bars.push(bar(i, price, 1000.0, 200.0));
            i += 1;
        }
        price += 2.5;
        bars.push(bar(i, price, 5000.0, 4000.0));
        i += 1;
        price -= 2.0;
        bars.push(bar(i, price, 5000.0, -4000.0));
        i += 1;
        for _ in 0..10 {
            price += 0.05;
            bars.push(bar(i, price, 1000.0, 200.0));
            i += 1;
        }
        bars
    }

    fn engine_with_threshold(threshold: f64) -> TopologyEngine {
        TopologyEngine::new(TopologyConfig {
            vortex_threshold: threshold,
            ..TopologyConfig::default()
        })
    }

    #[test]
    fn test_flat_window_is_neutral() {
        let bars: Vec<Bar> = (0..50).map(|i| bar(i, 100.0, 1000.0, 0.0)).collect();
        let snapshot = TopologyEngine::default().compute(&bars);
        assert_eq!(snapshot.coherence, 0.0);
        assert_eq!(snapshot.energy, 0.0);
        assert!(snapshot.vortexes.is_empty());
    }

    #[test]
    fn test_short_window_is_neutral() {
        let bars: Vec<Bar> = (0..2).map(|i| bar(i, 100.0 + i as f64, 1000.0, 100.0)).collect();
        let snapshot = TopologyEngine::default().compute(&bars);
        assert_eq!(snapshot.coherence, 0.0);
        assert!(snapshot.vortexes.is_empty());
        assert!(TopologyEngine::default().compute(&[]).timestamp.is_none());
    }

    #[test]
    fn test_reversal_rotation_stays_small() {
        let bars = reversal_window();
        let engine = engine_with_threshold(0.6);
        let max_rot = engine
            .rotation_series(&bars)
            .iter()
            .map(|p| p.rotation.abs())
            .fold(0.0, f64::max);
        assert!(max_rot < 0.03, "max |rot| = {}", max_rot);
    }

    #[test]
    fn test_vortex_threshold_is_tunable() {
        let bars = reversal_window();

        let strict = engine_with_threshold(0.6).compute(&bars);
        assert!(strict.vortexes.is_empty());

        let loose = engine_with_threshold(0.03).compute(&bars);
        assert!(!loose.vortexes.is_empty());
        assert!(loose.vortexes.iter().any(|v| v.index == 20 || v.index == 21));
        for vortex in &loose.vortexes {
            assert!(vortex.strength <= 1.0);
            // Both reversal rotations are negative
            assert_eq!(vortex.direction, VortexDirection::Clockwise);
        }
    }

    #[test]
    fn test_rotation_sign() {
        // (1, 0) -> (0, 1) is a quarter turn counter-clockwise
        assert!((rotation((1.0, 0.0), (0.0, 1.0), 1e-9) - 1.0).abs() < 1e-12);
        assert!((rotation((0.0, 1.0), (1.0, 0.0), 1e-9) + 1.0).abs() < 1e-12);
        assert_eq!(rotation((0.0, 0.0), (1.0, 1.0), 1e-9), 0.0);
    }

    #[test]
    fn test_only_trailing_window_is_used() {
        let mut bars = reversal_window();
        let engine = TopologyEngine::new(TopologyConfig {
            window_size: 10,
            vortex_threshold: 0.03,
            ..TopologyConfig::default()
        });
        let tail = engine.compute(&bars[bars.len() - 10..]);
        bars.insert(0, bar(-1, 50.0, 9000.0, -9000.0));
        assert_eq!(engine.compute(&bars), tail);
    }

    fn arb_bar() -> impl Strategy<Value = (f64, f64, f64)> {
        (1.0..1000.0_f64, 0.0..10_000.0_f64, -1.0..1.0_f64)
    }

    proptest! {
        #[test]
        fn rotation_bounded_and_deterministic(raw in prop::collection::vec(arb_bar(), 0..80)) {
            let bars: Vec<Bar> = raw
                .iter()
                .enumerate()
                .map(|(i, (close, volume, flow))| bar(i as i64, *close, *volume, flow * volume))
                .collect();
            let engine = TopologyEngine::default();

            for point in engine.rotation_series(&bars) {
                prop_assert!((-1.0..=1.0).contains(&point.rotation));
                prop_assert!(point.energy >= 0.0);
            }

            let first = engine.compute(&bars);
            let second = engine.compute(&bars);
            prop_assert!(first.coherence >= 0.0);
            prop_assert!(first.energy >= 0.0);
            prop_assert_eq!(first, second);
        }
    }
}
