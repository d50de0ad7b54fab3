//! Historical replay: load bars from CSV and feed them to a Runner
//!
//! Expected header: `timestamp,open,high,low,close,volume[,buy_volume,sell_volume]`.
//! Timestamps are RFC 3339 or naive ISO-8601 (read as UTC).

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::runner::BarSender;
use crate::types::Bar;

#[derive(Debug, Deserialize)]
struct CsvBar {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    buy_volume: Option<f64>,
    #[serde(default)]
    sell_volume: Option<f64>,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("Failed to parse timestamp: {}", raw))?;
    Ok(naive.and_utc())
}

pub fn read_bars<R: Read>(reader: R) -> Result<Vec<Bar>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut bars = Vec::new();

    for (line, result) in csv_reader.deserialize().enumerate() {
        let row: CsvBar = result.with_context(|| format!("Failed to parse CSV row {}", line + 1))?;
        let mut bar = Bar::new(
            parse_timestamp(&row.timestamp)?,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume,
        );
        if let (Some(buy), Some(sell)) = (row.buy_volume, row.sell_volume) {
            bar = bar.with_order_flow(buy, sell);
        }
        bars.push(bar);
    }
    Ok(bars)
}

pub fn load_csv(path: &Path) -> Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let bars = read_bars(BufReader::new(file))
        .with_context(|| format!("Failed to read bars from {:?}", path))?;
    info!("Loaded {} bars from {:?}", bars.len(), path);
    Ok(bars)
}

/// Step-by-step position over a loaded bar series
#[derive(Debug, Clone, Default)]
pub struct ReplayCursor {
    bars: Vec<Bar>,
    /// Index of the current bar; `None` before the first step
    position: Option<usize>,
}

impl ReplayCursor {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self { bars, position: None }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn current(&self) -> Option<&Bar> {
        self.position.and_then(|i| self.bars.get(i))
    }

    pub fn reset(&mut self) {
        self.position = None;
    }

    /// Advance one bar. `None` at the end; the cursor stays on the last bar.
    pub fn step(&mut self) -> Option<&Bar> {
        let next = self.position.map_or(0, |i| i + 1);
        if next >= self.bars.len() {
            return None;
        }
        self.position = Some(next);
        self.bars.get(next)
    }

    /// Up to `size` bars ending at the current one.
    pub fn window(&self, size: usize) -> &[Bar] {
        match self.position {
            Some(i) => &self.bars[(i + 1).saturating_sub(size)..=i],
            None => &[],
        }
    }
}

/// Send every bar to `sender`, sleeping `pace` between bars (zero for
/// as-fast-as-possible). Returns the number of bars sent.
pub async fn run_replay(sender: BarSender, bars: Vec<Bar>, pace: Duration) -> Result<usize> {
    let total = bars.len();
    info!("Replaying {} bars into {} (pace {:?})", total, sender.key(), pace);

    let mut cursor = ReplayCursor::new(bars);
    let mut sent = 0;
    while let Some(bar) = cursor.step() {
        if let Err(e) = sender.send(bar.clone()).await {
            warn!("Replay into {} ended early after {} bars: {}", sender.key(), sent, e);
            break;
        }
        sent += 1;
        if sent % 1000 == 0 {
            debug!("Replay {}: {}/{}", sender.key(), sent, total);
        }
        if !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
    }

    info!("Replay into {} finished: {} bars", sender.key(), sent);
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{SnapshotBroadcaster, SubscriptionFilter};
    use crate::config::RunnerConfig;
    use crate::runner::{spawn_runner, Runner};
    use crate::types::RunnerKey;
    use std::sync::Arc;

    const SAMPLE: &str = "\
timestamp,open,high,low,close,volume,buy_volume,sell_volume
2025-01-01T00:00:00Z,100.0,101.0,99.5,100.5,1200,700,500
2025-01-01T00:01:00,100.5,100.8,99.9,100.0,900,,
2025-01-01 00:02:00,100.0,100.4,99.6,100.2,1000,450,550
";

    #[test]
    fn test_read_bars() {
        let bars = read_bars(SAMPLE.as_bytes()).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].order_flow_delta(), Some(200.0));
        assert_eq!(bars[1].order_flow_delta(), None);
        assert_eq!(bars[2].order_flow_delta(), Some(-100.0));
        assert!(bars[0].timestamp < bars[1].timestamp);
        assert!(bars[1].timestamp < bars[2].timestamp);
    }

    #[test]
    fn test_bad_timestamp_is_reported() {
        let text = "timestamp,open,high,low,close,volume\nyesterday,1,1,1,1,1\n";
        let err = read_bars(text.as_bytes()).unwrap_err();
        assert!(format!("{:#}", err).contains("yesterday"));
    }

    #[test]
    fn test_cursor_steps_and_windows() {
        let mut cursor = ReplayCursor::new(read_bars(SAMPLE.as_bytes()).unwrap());
        assert!(cursor.current().is_none());
        assert!(cursor.window(5).is_empty());

        assert!(cursor.step().is_some());
        assert!(cursor.step().is_some());
        assert_eq!(cursor.window(5).len(), 2);
        assert_eq!(cursor.window(1).len(), 1);
        assert!(cursor.step().is_some());
        assert!(cursor.step().is_none());
        assert_eq!(cursor.position(), Some(2));

        cursor.reset();
        assert_eq!(cursor.step().map(|b| b.close), Some(100.5));
    }

    #[tokio::test]
    async fn test_replay_feeds_runner() {
        let hub = Arc::new(SnapshotBroadcaster::default());
        let key = RunnerKey::new("BTCUSD", "1m");
        let mut sub = hub.subscribe(SubscriptionFilter::Key(key.clone()));
        let runner = Runner::new(key.clone(), RunnerConfig::seeded(4)).unwrap();
        let handle = spawn_runner(runner, Arc::clone(&hub));

        let bars = read_bars(SAMPLE.as_bytes()).unwrap();
        let sent = run_replay(handle.sender(), bars, Duration::ZERO).await.unwrap();
        assert_eq!(sent, 3);
        for _ in 0..3 {
            sub.recv().await.unwrap();
        }
        handle.stop().await.unwrap();
        assert_eq!(hub.latest(&key).unwrap().bars_processed, 3);
    }
}
