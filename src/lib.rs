// Library crate - engines, runners and the snapshot broadcaster

pub mod api;
pub mod broadcast;
pub mod config;
pub mod engines;
pub mod error;
pub mod execution;
pub mod runner;
pub mod streams;
pub mod types;

// Re-export commonly used types
pub use broadcast::{SnapshotBroadcaster, SnapshotSubscription, SubscriptionFilter};
pub use config::RunnerConfig;
pub use error::{BarError, ConfigError, RegistryError};
pub use runner::{spawn_runner, BarSender, Runner, RunnerHandle, RunnerRegistry, RunnerSnapshot};
pub use types::{Bar, Direction, RunnerKey};
