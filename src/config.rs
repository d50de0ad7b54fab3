//! Configuration for the analytical engines and the paper-trading runner

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Topology engine parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Number of trailing bars analysed per snapshot
    pub window_size: usize,
    /// Minimum composite score (|rotation| x normalized energy) for a vortex
    pub vortex_threshold: f64,
    /// Energy percentile a bar must reach to qualify as a vortex
    pub vortex_energy_percentile: f64,
    /// Vector magnitude product below which rotation is treated as zero
    pub epsilon: f64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            vortex_threshold: 0.08,
            vortex_energy_percentile: 0.70,
            epsilon: 1e-9,
        }
    }
}

/// Predictive (Monte Carlo) engine parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    pub window_size: usize,
    /// Steps simulated per scenario
    pub horizon_bars: usize,
    pub num_scenarios: usize,
    /// Trailing bars used for ATR and the recent high/low
    pub atr_period: usize,
    /// Breakout levels sit this many ATRs beyond the recent high/low
    pub breakout_atr_mult: f64,
    /// Fixed RNG seed. A Runner seeds its one generator from this, or from
    /// OS entropy when `None`; `PredictiveEngine::compute` reseeds per call.
    pub seed: Option<u64>,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            window_size: 200,
            horizon_bars: 20,
            num_scenarios: 20,
            atr_period: 20,
            breakout_atr_mult: 1.0,
            seed: None,
        }
    }
}

/// Signal generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Breakout probability needed for a directional signal
    pub breakout_threshold: f64,
    /// Enable the cumulative-delta trend filter
    pub delta_filter: bool,
    /// Bars summed for the delta trend
    pub delta_lookback: usize,
    /// Delta/volume ratio that counts as a full-strength trend
    pub delta_threshold: f64,
    /// A non-neutral trend weaker than this suppresses the breakout
    pub min_delta_strength: f64,
    /// Opposing trend at or above this strength blocks the breakout
    pub block_strength: f64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            breakout_threshold: 0.60,
            delta_filter: false,
            delta_lookback: 10,
            delta_threshold: 0.6,
            min_delta_strength: 0.30,
            block_strength: 0.5,
        }
    }
}

/// Paper-trading parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Minimum signal confidence to open a position
    pub min_confidence: f64,
    /// Stop loss distance in percent of entry
    pub stop_loss_pct: f64,
    /// Take profit distance in percent of entry
    pub take_profit_pct: f64,
    /// Bars after which an open position is closed at market
    pub max_hold_bars: usize,
    /// Close an open position when an opposing breakout fires
    pub close_on_opposing_signal: bool,
    /// Confidence an opposing breakout needs to close the position
    pub min_reversal_confidence: f64,
    pub starting_equity: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.62,
            stop_loss_pct: 1.0,
            take_profit_pct: 1.0,
            max_hold_bars: 60,
            close_on_opposing_signal: true,
            min_reversal_confidence: 0.70,
            starting_equity: 10_000.0,
        }
    }
}

/// Everything a Runner needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub topology: TopologyConfig,
    pub predictive: PredictiveConfig,
    pub signals: SignalsConfig,
    pub trading: TradingConfig,
    /// Bars collected before signals are evaluated
    pub warmup_bars: usize,
    /// Bound of the per-runner bar queue
    pub channel_capacity: usize,
    /// Closed trades and breakout signals each Runner keeps in memory
    pub history_capacity: usize,
}

impl RunnerConfig {
    /// Defaults with a fixed Monte Carlo seed (reproducible replays)
    pub fn seeded(seed: u64) -> Self {
        let mut config = Self::default();
        config.predictive.seed = Some(seed);
        config
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RunnerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Bars the Runner must retain to feed both engines
    pub fn history_len(&self) -> usize {
        self.topology
            .window_size
            .max(self.predictive.window_size)
            .max(self.signals.delta_lookback)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.topology;
        positive("topology.window_size", t.window_size as f64)?;
        non_negative("topology.vortex_threshold", t.vortex_threshold)?;
        unit_range("topology.vortex_energy_percentile", t.vortex_energy_percentile)?;
        non_negative("topology.epsilon", t.epsilon)?;

        let p = &self.predictive;
        positive("predictive.window_size", p.window_size as f64)?;
        positive("predictive.horizon_bars", p.horizon_bars as f64)?;
        positive("predictive.num_scenarios", p.num_scenarios as f64)?;
        positive("predictive.atr_period", p.atr_period as f64)?;
        non_negative("predictive.breakout_atr_mult", p.breakout_atr_mult)?;

        let s = &self.signals;
        unit_range("signals.breakout_threshold", s.breakout_threshold)?;
        positive("signals.delta_lookback", s.delta_lookback as f64)?;
        positive("signals.delta_threshold", s.delta_threshold)?;
        unit_range("signals.min_delta_strength", s.min_delta_strength)?;
        unit_range("signals.block_strength", s.block_strength)?;

        let tr = &self.trading;
        unit_range("trading.min_confidence", tr.min_confidence)?;
        positive("trading.stop_loss_pct", tr.stop_loss_pct)?;
        positive("trading.take_profit_pct", tr.take_profit_pct)?;
        positive("trading.max_hold_bars", tr.max_hold_bars as f64)?;
        unit_range("trading.min_reversal_confidence", tr.min_reversal_confidence)?;
        positive("trading.starting_equity", tr.starting_equity)?;

        positive("channel_capacity", self.channel_capacity as f64)?;
        positive("history_capacity", self.history_capacity as f64)?;
        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::default(),
            predictive: PredictiveConfig::default(),
            signals: SignalsConfig::default(),
            trading: TradingConfig::default(),
            warmup_bars: 5,
            channel_capacity: 256,
            history_capacity: 200,
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max: f64::INFINITY,
        })
    }
}

fn unit_range(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max: 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RunnerConfig::default().validate().is_ok());
        assert_eq!(RunnerConfig::default().history_len(), 200);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = RunnerConfig::default();
        config.predictive.horizon_bars = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "predictive.horizon_bars", .. })
        ));

        let mut config = RunnerConfig::default();
        config.topology.vortex_threshold = -0.1;
        assert!(config.validate().is_err());

        let mut config = RunnerConfig::default();
        config.signals.breakout_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config = RunnerConfig::from_toml_str(
            r#"
            warmup_bars = 10

            [topology]
            vortex_threshold = 0.6

            [trading]
            stop_loss_pct = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.warmup_bars, 10);
        assert_eq!(config.topology.vortex_threshold, 0.6);
        assert_eq!(config.topology.window_size, 100);
        assert_eq!(config.trading.stop_loss_pct, 0.5);
        assert_eq!(config.trading.take_profit_pct, 1.0);
    }

    #[test]
    fn test_toml_validation_runs() {
        let result = RunnerConfig::from_toml_str("[predictive]\nnum_scenarios = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_syntax_error_keeps_source() {
        let err = RunnerConfig::from_toml_str("[topology\nwindow_size = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(std::error::Error::source(&err).is_some());

        let err = RunnerConfig::from_toml_str("warmup_bars = \"five\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
