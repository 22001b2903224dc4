// Kafka source framework - offset/acknowledgement coordination around a
// partitioned log transport
pub mod acks;
pub mod buffer;
pub mod client;
pub mod commit_tracker;
pub mod config;
pub mod consumer;
pub mod decode;
pub mod ownership;
pub mod transport;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use config::{ClientConfigBuilder, ConsumerConfig};
pub use consumer::{KafkaSourceConsumer, SourceState};
pub use transport::{ConsumerTransport, RebalanceListener};
