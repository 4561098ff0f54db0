// Metrics module: per-model/per-account request statistics for the admin
// surface and for the Drop-based request/stream accounting in routes::mod.

pub mod collector;

pub use collector::{MetricsCollector, StreamingMetricsTracker};
