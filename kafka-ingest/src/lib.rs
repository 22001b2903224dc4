//! Kafka ingestion source.
//!
//! Reads from a partitioned log, decodes records into structured events, and
//! pushes them into a bounded downstream buffer. Offsets are only committed
//! once downstream acknowledges the records, with per-partition ownership
//! epochs guarding against completions from superseded rebalance sessions.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` values, use formats that include the full
//! cause chain: `{e:#}` inline or `error = ?e` as a structured field. Plain
//! Display only shows the top-level message and hides the root cause.

pub mod config;
pub mod kafka;
pub mod metrics_const;
pub mod service;

// Re-export commonly used types for convenience
pub use config::Config;
pub use service::IngestService;
