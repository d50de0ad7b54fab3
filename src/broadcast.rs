//! Latest-snapshot store plus push fan-out
//!
//! Pull readers get the most recent `Arc<RunnerSnapshot>` per key. Push
//! subscribers receive every published snapshot over a broadcast channel;
//! a subscriber that falls behind loses its oldest messages, nobody else is
//! affected.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

use crate::runner::RunnerSnapshot;
use crate::types::RunnerKey;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    Key(RunnerKey),
}

impl SubscriptionFilter {
    pub fn matches(&self, key: &RunnerKey) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Key(k) => k == key,
        }
    }
}

#[derive(Debug)]
pub struct SnapshotBroadcaster {
    latest: RwLock<HashMap<RunnerKey, Arc<RunnerSnapshot>>>,
    tx: broadcast::Sender<Arc<RunnerSnapshot>>,
}

impl SnapshotBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Replace the stored snapshot for its key, then push it.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, snapshot: Arc<RunnerSnapshot>) -> usize {
        {
            let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
            latest.insert(snapshot.key.clone(), Arc::clone(&snapshot));
        }
        // No subscribers is not an error
        self.tx.send(snapshot).unwrap_or(0)
    }

    pub fn latest(&self, key: &RunnerKey) -> Option<Arc<RunnerSnapshot>> {
        let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
        latest.get(key).cloned()
    }

    /// Every key's latest snapshot, ordered by key.
    pub fn latest_all(&self) -> Vec<Arc<RunnerSnapshot>> {
        let mut all: Vec<Arc<RunnerSnapshot>> = {
            let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
            latest.values().cloned().collect()
        };
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn keys(&self) -> Vec<RunnerKey> {
        let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<RunnerKey> = latest.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop the stored snapshot for `key`.
    pub fn forget(&self, key: &RunnerKey) -> Option<Arc<RunnerSnapshot>> {
        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        latest.remove(key)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> SnapshotSubscription {
        SnapshotSubscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[derive(Debug)]
pub struct SnapshotSubscription {
    rx: broadcast::Receiver<Arc<RunnerSnapshot>>,
    filter: SubscriptionFilter,
}

impl SnapshotSubscription {
    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    /// Next matching snapshot; `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Arc<RunnerSnapshot>> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) if self.filter.matches(&snapshot.key) => return Some(snapshot),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Snapshot subscriber lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{PredictiveSnapshot, TopologySnapshot};
    use crate::execution::RunnerStats;
    use crate::types::Bar;
    use chrono::{Duration, TimeZone, Utc};

    /// Bar close and trade count both carry `tick`, so a mixed snapshot is detectable.
    fn snapshot(key: &RunnerKey, tick: u64) -> Arc<RunnerSnapshot> {
        let ts =
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(tick as i64);
        let price = 100.0 + tick as f64;
        let mut stats = RunnerStats::new(10_000.0);
        stats.total_trades = tick;
        Arc::new(RunnerSnapshot {
            key: key.clone(),
            bar: Bar::new(ts, price, price, price, price, 1.0),
            topology: TopologySnapshot {
                timestamp: Some(ts),
                coherence: 0.0,
                energy: 0.0,
                vortexes: Vec::new(),
            },
            predictive: PredictiveSnapshot {
                timestamp: Some(ts),
                horizon_bars: 0,
                num_scenarios: 0,
                ifi: 0.0,
                breakout_probability_up: 0.0,
                breakout_probability_down: 0.0,
                energy_collapse_risk: 0.0,
                breakout_level_up: price,
                breakout_level_down: price,
                cone_upper: Vec::new(),
                cone_lower: Vec::new(),
            },
            signal: None,
            stats,
            bars_processed: tick,
            last_trade: None,
            trade_history: Arc::default(),
            signal_history: Arc::default(),
        })
    }

    #[test]
    fn test_latest_replaces_per_key() {
        let hub = SnapshotBroadcaster::default();
        let btc = RunnerKey::new("BTCUSDT", "1m");
        let eth = RunnerKey::new("ETHUSDT", "1m");
        assert!(hub.latest(&btc).is_none());

        hub.publish(snapshot(&btc, 1));
        hub.publish(snapshot(&btc, 2));
        hub.publish(snapshot(&eth, 7));

        assert_eq!(hub.latest(&btc).unwrap().bars_processed, 2);
        let all = hub.latest_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, btc);
        assert_eq!(hub.keys(), vec![btc.clone(), eth]);

        assert!(hub.forget(&btc).is_some());
        assert!(hub.latest(&btc).is_none());
    }

    #[tokio::test]
    async fn test_subscription_filters_by_key() {
        let hub = SnapshotBroadcaster::default();
        let btc = RunnerKey::new("BTCUSDT", "1m");
        let eth = RunnerKey::new("ETHUSDT", "5m");
        let mut only_eth = hub.subscribe(SubscriptionFilter::Key(eth.clone()));
        let mut all = hub.subscribe(SubscriptionFilter::All);

        assert_eq!(hub.publish(snapshot(&btc, 1)), 2);
        hub.publish(snapshot(&eth, 2));

        assert_eq!(only_eth.recv().await.unwrap().key, eth);
        assert_eq!(all.recv().await.unwrap().key, btc);
        assert_eq!(all.recv().await.unwrap().key, eth);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let hub = SnapshotBroadcaster::new(4);
        let key = RunnerKey::new("BTCUSDT", "1m");
        let mut slow = hub.subscribe(SubscriptionFilter::All);

        for tick in 0..10 {
            hub.publish(snapshot(&key, tick));
        }
        // Oldest six were overwritten; the rest arrive in order
        let first = slow.recv().await.unwrap();
        assert_eq!(first.bars_processed, 6);
        assert_eq!(slow.recv().await.unwrap().bars_processed, 7);
        // Pull side is unaffected
        assert_eq!(hub.latest(&key).unwrap().bars_processed, 9);
    }

    #[tokio::test]
    async fn test_recv_ends_when_broadcaster_dropped() {
        let hub = SnapshotBroadcaster::default();
        let mut sub = hub.subscribe(SubscriptionFilter::All);
        drop(hub);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_readers_never_see_mixed_snapshots() {
        let hub = Arc::new(SnapshotBroadcaster::default());
        let key = RunnerKey::new("BTCUSDT", "1m");
        hub.publish(snapshot(&key, 0));

        let writer = {
            let hub = Arc::clone(&hub);
            let key = key.clone();
            std::thread::spawn(move || {
                for tick in 1..=5_000 {
                    hub.publish(snapshot(&key, tick));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let hub = Arc::clone(&hub);
                let key = key.clone();
                std::thread::spawn(move || {
                    let mut last_seen = 0;
                    for _ in 0..5_000 {
                        let snap = hub.latest(&key).unwrap();
                        assert_eq!(snap.bar.close - 100.0, snap.stats.total_trades as f64);
                        assert_eq!(snap.bars_processed, snap.stats.total_trades);
                        // Replace-on-write never goes backwards
                        assert!(snap.bars_processed >= last_seen);
                        last_seen = snap.bars_processed;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(hub.latest(&key).unwrap().bars_processed, 5_000);
    }
}
