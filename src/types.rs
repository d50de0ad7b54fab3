use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BarError;

/// One OHLCV candle with an optional aggressor-side volume split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub buy_volume: Option<f64>,
    #[serde(default)]
    pub sell_volume: Option<f64>,
    #[serde(default)]
    pub delta: Option<f64>,
}

impl Bar {
    /// Bar without order-flow information.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            buy_volume: None,
            sell_volume: None,
            delta: None,
        }
    }

    /// Attach a buy/sell split; delta is derived from it.
    pub fn with_order_flow(mut self, buy_volume: f64, sell_volume: f64) -> Self {
        self.buy_volume = Some(buy_volume);
        self.sell_volume = Some(sell_volume);
        self.delta = Some(buy_volume - sell_volume);
        self
    }

    /// Buy minus sell volume, if known.
    pub fn order_flow_delta(&self) -> Option<f64> {
        if self.delta.is_some() {
            return self.delta;
        }
        match (self.buy_volume, self.sell_volume) {
            (Some(buy), Some(sell)) => Some(buy - sell),
            _ => None,
        }
    }

    /// Check OHLCV sanity. Timestamp ordering is the Runner's concern.
    pub fn validate(&self) -> Result<(), BarError> {
        let fields = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(BarError::NonFinite { field });
            }
        }
        if self.volume < 0.0 {
            return Err(BarError::NegativeVolume(self.volume));
        }
        if self.high < self.low
            || self.high < self.open.max(self.close)
            || self.low > self.open.min(self.close)
        {
            return Err(BarError::InvalidRange {
                high: self.high,
                low: self.low,
            });
        }
        Ok(())
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Identifies one Runner: an (instrument, timeframe) pair.
///
/// Renders as `SYMBOL_interval` (e.g. `BTCUSDT_1m`), which is also the form
/// accepted by `FromStr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerKey {
    pub symbol: String,
    pub interval: String,
}

impl RunnerKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            interval: interval.into(),
        }
    }
}

impl fmt::Display for RunnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.symbol, self.interval)
    }
}

impl FromStr for RunnerKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('_') {
            Some((symbol, interval)) if !symbol.is_empty() && !interval.is_empty() => {
                Ok(RunnerKey::new(symbol, interval))
            }
            _ => Err(format!("invalid runner key '{}', expected SYMBOL_interval", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_delta_from_split() {
        let bar = Bar::new(ts(), 100.0, 101.0, 99.0, 100.5, 1000.0).with_order_flow(600.0, 400.0);
        assert_eq!(bar.order_flow_delta(), Some(200.0));

        let mut bar = Bar::new(ts(), 100.0, 101.0, 99.0, 100.5, 1000.0);
        assert_eq!(bar.order_flow_delta(), None);
        bar.buy_volume = Some(300.0);
        bar.sell_volume = Some(700.0);
        assert_eq!(bar.order_flow_delta(), Some(-400.0));
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let good = Bar::new(ts(), 100.0, 101.0, 99.0, 100.5, 1000.0);
        assert!(good.validate().is_ok());

        let inverted = Bar::new(ts(), 100.0, 99.0, 101.0, 100.0, 1000.0);
        assert!(matches!(inverted.validate(), Err(BarError::InvalidRange { .. })));

        let nan = Bar::new(ts(), f64::NAN, 101.0, 99.0, 100.0, 1000.0);
        assert!(matches!(nan.validate(), Err(BarError::NonFinite { field: "open" })));

        let negative = Bar::new(ts(), 100.0, 101.0, 99.0, 100.0, -1.0);
        assert!(matches!(negative.validate(), Err(BarError::NegativeVolume(_))));
    }

    #[test]
    fn test_runner_key_round_trip() {
        let key = RunnerKey::new("btcusdt", "1m");
        assert_eq!(key.to_string(), "BTCUSDT_1m");
        assert_eq!("BTCUSDT_1m".parse::<RunnerKey>().unwrap(), key);
        assert!("BTCUSDT".parse::<RunnerKey>().is_err());
    }
}
