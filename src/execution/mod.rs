//! Paper execution: a single-position tracker driven by signals
//!
//! No orders leave the process; fills happen at bar close or at the
//! stop/target level the bar crosses.

mod position;

pub use position::{ClosedTrade, ExitReason, Position, PositionTracker, RunnerStats, Transition};
