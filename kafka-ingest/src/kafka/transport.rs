//! Transport seam for the partitioned log.
//!
//! The consumer loop drives everything through [`ConsumerTransport`];
//! rebalance callbacks arrive inline from within `poll` and receive a
//! [`TransportSession`] so revocation can flush commits synchronously before
//! ownership is lost. `client.rs` implements the seam over rdkafka, the mock
//! in `test_utils.rs` scripts it for tests.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::kafka::types::Partition;

/// One raw record as delivered by the transport; payload decoding happens in
/// the consumer.
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create transport client: {0}")]
    Client(String),
    #[error("transport authentication failed: {0}")]
    Authentication(String),
    #[error("poll failed: {0}")]
    Poll(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("seek on {partition} to {offset} failed: {message}")]
    Seek {
        partition: Partition,
        offset: i64,
        message: String,
    },
    #[error("committed-offset fetch for {partition} failed: {message}")]
    OffsetFetch {
        partition: Partition,
        message: String,
    },
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

impl TransportError {
    /// Authentication failures are retried with a longer fixed backoff
    /// instead of counting as iteration errors.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// The subset of transport operations rebalance callbacks may use while the
/// transport itself is blocked inside `poll`.
pub trait TransportSession {
    /// Synchronous batched commit; the map holds the next offset to consume
    /// per partition.
    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), TransportError>;

    /// Last committed offset (next offset to consume), `None` if the group
    /// never committed this partition.
    fn committed_offset(&self, partition: &Partition) -> Result<Option<i64>, TransportError>;
}

pub trait ConsumerTransport: TransportSession + Send + Sync {
    /// Blocking bounded poll. An empty vec means the timeout elapsed without
    /// records, which is not an error.
    fn poll(&self, timeout: Duration) -> Result<Vec<TransportRecord>, TransportError>;

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), TransportError>;

    fn subscribe(&self, topics: &[String]) -> Result<(), TransportError>;

    /// Partitions currently assigned to this consumer.
    fn assignment(&self) -> Result<Vec<Partition>, TransportError>;

    /// Unblock an in-progress poll, if the transport supports it. Shutdown
    /// correctness only relies on the poll timeout bound.
    fn wake(&self);
}

/// Rebalance notifications, invoked synchronously on the polling thread from
/// within the transport's own callback context.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_assigned(&self, session: &dyn TransportSession, partitions: &[Partition]);

    fn on_partitions_revoked(&self, session: &dyn TransportSession, partitions: &[Partition]);
}
