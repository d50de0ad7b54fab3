//! Analytical engines, run in this order on every bar:
//! - Topology: rotation and energy of the return / order-flow plane
//! - Predictive: Monte Carlo breakout probabilities and IFI
//! - Signals: one discrete signal from the predictive snapshot

pub mod predictive;
pub mod signals;
pub mod topology;

pub use predictive::{PredictiveEngine, PredictiveSnapshot};
pub use signals::{DeltaTrend, IfiTrend, Signal, SignalType, SignalsEngine, TrendBias};
pub use topology::{RotationPoint, TopologyEngine, TopologySnapshot, VortexDirection, VortexMarker};
