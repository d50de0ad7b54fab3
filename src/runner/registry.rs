//! Registry of running Runners, keyed by (instrument, timeframe)

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{spawn_runner, BarSender, Runner, RunnerHandle};
use crate::broadcast::SnapshotBroadcaster;
use crate::config::RunnerConfig;
use crate::error::RegistryError;
use crate::execution::RunnerStats;
use crate::types::{Bar, RunnerKey};

pub struct RunnerRegistry {
    runners: Mutex<HashMap<RunnerKey, RunnerHandle>>,
    broadcaster: Arc<SnapshotBroadcaster>,
    default_config: RunnerConfig,
}

impl RunnerRegistry {
    pub fn new(broadcaster: Arc<SnapshotBroadcaster>) -> Self {
        Self::with_default_config(broadcaster, RunnerConfig::default())
    }

    /// `default_config` is used by `start` calls that pass no config.
    pub fn with_default_config(
        broadcaster: Arc<SnapshotBroadcaster>,
        default_config: RunnerConfig,
    ) -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
            broadcaster,
            default_config,
        }
    }

    pub fn broadcaster(&self) -> &Arc<SnapshotBroadcaster> {
        &self.broadcaster
    }

    pub fn default_config(&self) -> &RunnerConfig {
        &self.default_config
    }

    /// Construct and spawn a Runner for `key`. Fails with `AlreadyRunning`
    /// while a previous Runner for the key is still shutting down.
    pub async fn start(
        &self,
        key: RunnerKey,
        config: Option<RunnerConfig>,
    ) -> Result<BarSender, RegistryError> {
        self.start_with_stats(key, config, None).await
    }

    /// Like `start`, seeding the Runner's statistics first.
    pub async fn start_with_stats(
        &self,
        key: RunnerKey,
        config: Option<RunnerConfig>,
        stats: Option<RunnerStats>,
    ) -> Result<BarSender, RegistryError> {
        let mut runners = self.runners.lock().await;
        if runners.get(&key).is_some_and(|existing| !existing.is_finished()) {
            return Err(RegistryError::AlreadyRunning(key));
        }

        let config = config.unwrap_or_else(|| self.default_config.clone());
        let mut runner =
            Runner::new(key.clone(), config).map_err(|source| RegistryError::InvalidConfig {
                key: key.clone(),
                source,
            })?;
        if let Some(stats) = stats {
            runner.restore_stats(stats);
        }

        // Reap a finished task under this key before its successor can publish
        if let Some(stale) = runners.remove(&key) {
            if let Err(e) = stale.stop().await {
                warn!("Stale runner {}: {}", key, e);
            }
        }
        let handle = spawn_runner(runner, Arc::clone(&self.broadcaster));
        let sender = handle.sender();
        runners.insert(key.clone(), handle);
        info!("Registered runner {} ({} active)", key, runners.len());
        Ok(sender)
    }

    /// Stop one Runner and wait for its task to publish its final snapshot.
    /// The registry stays locked until then, so no successor can start on the
    /// same key while the old task is still writing.
    pub async fn stop(&self, key: &RunnerKey) -> Result<RunnerStats, RegistryError> {
        let mut runners = self.runners.lock().await;
        match runners.remove(key) {
            Some(handle) => handle.stop().await,
            None => Err(RegistryError::NotRunning(key.clone())),
        }
    }

    pub async fn stop_all(&self) -> Vec<(RunnerKey, RunnerStats)> {
        let mut runners = self.runners.lock().await;
        let handles: Vec<RunnerHandle> = runners.drain().map(|(_, h)| h).collect();

        let mut stopped = Vec::with_capacity(handles.len());
        for handle in handles {
            let key = handle.key().clone();
            match handle.stop().await {
                Ok(stats) => stopped.push((key, stats)),
                Err(e) => warn!("Failed to stop {}: {}", key, e),
            }
        }
        stopped.sort_by(|a, b| a.0.cmp(&b.0));
        stopped
    }

    /// Queue a bar for `key`. Waits while that Runner's queue is full; the
    /// registry lock is not held while waiting.
    pub async fn submit(&self, key: &RunnerKey, bar: Bar) -> Result<(), RegistryError> {
        let sender = self
            .sender(key)
            .await
            .ok_or_else(|| RegistryError::NotRunning(key.clone()))?;
        sender.send(bar).await
    }

    pub async fn sender(&self, key: &RunnerKey) -> Option<BarSender> {
        let runners = self.runners.lock().await;
        runners.get(key).map(RunnerHandle::sender)
    }

    pub async fn is_running(&self, key: &RunnerKey) -> bool {
        let runners = self.runners.lock().await;
        runners.get(key).is_some_and(|h| !h.is_finished())
    }

    pub async fn keys(&self) -> Vec<RunnerKey> {
        let runners = self.runners.lock().await;
        let mut keys: Vec<RunnerKey> = runners.keys().cloned().collect();
        keys.sort();
        keys
    }
}
