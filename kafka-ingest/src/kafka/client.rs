//! rdkafka-backed implementation of the transport seam.
//!
//! Rebalance callbacks surface through a custom [`ConsumerContext`]: rdkafka
//! invokes `pre_rebalance`/`post_rebalance` inline on the polling thread, and
//! the context forwards them to the [`RebalanceListener`] together with a
//! session handle backed by the same underlying consumer, so revocation can
//! commit synchronously before ownership moves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::transport::{
    ConsumerTransport, RebalanceListener, TransportError, TransportRecord, TransportSession,
};
use crate::kafka::types::Partition;

/// Broker round-trip bound for the blocking metadata calls (committed-offset
/// fetch, seek).
const BROKER_CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IngestConsumerContext {
    listener: Arc<dyn RebalanceListener>,
}

impl ClientContext for IngestConsumerContext {}

impl ConsumerContext for IngestConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                if tpl.count() == 0 {
                    return;
                }
                let partitions = partitions_of(tpl);
                info!(count = partitions.len(), "revoking partitions");
                let session = CallbackSession {
                    consumer: base_consumer,
                };
                self.listener.on_partitions_revoked(&session, &partitions);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!(error = %e, "rebalance error"),
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                if tpl.count() == 0 {
                    return;
                }
                let partitions = partitions_of(tpl);
                info!(count = partitions.len(), "assigned partitions");
                let session = CallbackSession {
                    consumer: base_consumer,
                };
                self.listener.on_partitions_assigned(&session, &partitions);
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => error!(error = %e, "post-rebalance error"),
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "offsets committed"),
            Err(e) => warn!(error = %e, "offset commit reported failure"),
        }
    }
}

/// Session handle handed to rebalance callbacks, scoped to the consumer
/// reference rdkafka provides inside the callback.
struct CallbackSession<'a> {
    consumer: &'a BaseConsumer<IngestConsumerContext>,
}

impl TransportSession for CallbackSession<'_> {
    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), TransportError> {
        commit_offsets(self.consumer, offsets)
    }

    fn committed_offset(&self, partition: &Partition) -> Result<Option<i64>, TransportError> {
        fetch_committed_offset(self.consumer, partition)
    }
}

/// rdkafka transport for one consumer instance.
pub struct KafkaTransport {
    consumer: BaseConsumer<IngestConsumerContext>,
    max_batch_size: usize,
}

impl KafkaTransport {
    pub fn new(
        config: ClientConfig,
        listener: Arc<dyn RebalanceListener>,
        max_batch_size: usize,
    ) -> Result<Self, TransportError> {
        let consumer = config
            .create_with_context(IngestConsumerContext { listener })
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self {
            consumer,
            max_batch_size,
        })
    }
}

impl TransportSession for KafkaTransport {
    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), TransportError> {
        commit_offsets(&self.consumer, offsets)
    }

    fn committed_offset(&self, partition: &Partition) -> Result<Option<i64>, TransportError> {
        fetch_committed_offset(&self.consumer, partition)
    }
}

impl ConsumerTransport for KafkaTransport {
    fn poll(&self, timeout: Duration) -> Result<Vec<TransportRecord>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();

        while records.len() < self.max_batch_size {
            // Block only while the batch is empty; once something arrived,
            // drain whatever else is already queued and return.
            let wait = if records.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            if records.is_empty() && wait.is_zero() {
                break;
            }

            match self.consumer.poll(wait) {
                Some(Ok(message)) => {
                    records.push(TransportRecord {
                        partition: Partition::new(message.topic(), message.partition()),
                        offset: message.offset(),
                        key: message
                            .key()
                            .map(|key| String::from_utf8_lossy(key).into_owned()),
                        payload: message.payload().map(|payload| payload.to_vec()),
                    });
                }
                Some(Err(e)) => {
                    if records.is_empty() {
                        return Err(map_poll_error(e));
                    }
                    warn!(error = %e, "transport error mid-batch, returning partial batch");
                    break;
                }
                None => break,
            }
        }

        Ok(records)
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), TransportError> {
        self.consumer
            .seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset),
                BROKER_CALL_TIMEOUT,
            )
            .map_err(|e| TransportError::Seek {
                partition: partition.clone(),
                offset,
                message: e.to_string(),
            })
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    fn assignment(&self) -> Result<Vec<Partition>, TransportError> {
        self.consumer
            .assignment()
            .map(|tpl| partitions_of(&tpl))
            .map_err(|e| TransportError::Poll(e.to_string()))
    }

    fn wake(&self) {
        // Poll is bounded by its timeout; the shutdown flag is observed
        // within one poll interval.
    }
}

fn commit_offsets(
    consumer: &BaseConsumer<IngestConsumerContext>,
    offsets: &HashMap<Partition, i64>,
) -> Result<(), TransportError> {
    let mut tpl = TopicPartitionList::new();
    for (partition, next_offset) in offsets {
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*next_offset),
        )
        .map_err(|e| TransportError::Commit(e.to_string()))?;
    }
    consumer
        .commit(&tpl, CommitMode::Sync)
        .map_err(|e| TransportError::Commit(e.to_string()))
}

fn fetch_committed_offset(
    consumer: &BaseConsumer<IngestConsumerContext>,
    partition: &Partition,
) -> Result<Option<i64>, TransportError> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(partition.topic(), partition.partition_number());
    let committed = consumer
        .committed_offsets(tpl, BROKER_CALL_TIMEOUT)
        .map_err(|e| TransportError::OffsetFetch {
            partition: partition.clone(),
            message: e.to_string(),
        })?;
    Ok(committed.elements().first().and_then(|elem| match elem.offset() {
        Offset::Offset(offset) => Some(offset),
        _ => None,
    }))
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements()
        .into_iter()
        .map(|elem| Partition::new(elem.topic(), elem.partition()))
        .collect()
}

fn map_poll_error(e: KafkaError) -> TransportError {
    match &e {
        KafkaError::MessageConsumption(code) if is_auth_code(*code) => {
            TransportError::Authentication(e.to_string())
        }
        _ => TransportError::Poll(e.to_string()),
    }
}

fn is_auth_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Authentication | RDKafkaErrorCode::SaslAuthenticationFailed
    )
}
