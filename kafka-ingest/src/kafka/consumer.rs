//! The consumer loop and its shared offset/acknowledgement state.
//!
//! One [`KafkaSourceConsumer`] runs per worker on a dedicated blocking
//! thread. Everything the loop shares with other execution contexts —
//! ownership epochs, commit trackers, the pending-commit map, the completed
//! and reset queues — lives in [`SourceState`] behind a single mutex.
//! Acknowledgement callbacks (arbitrary downstream threads) only push onto
//! the queues; rebalance callbacks run inline on the polling thread and take
//! the same lock, so revocation flushes commits in one critical section.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::kafka::acks::AckGroupManager;
use crate::kafka::buffer::{BackpressureEnqueuer, BufferedRecord, EventBuffer};
use crate::kafka::commit_tracker::PartitionCommitTracker;
use crate::kafka::config::ConsumerConfig;
use crate::kafka::decode::{EventDecoder, IngestEvent};
use crate::kafka::ownership::OwnershipRegistry;
use crate::kafka::transport::{
    ConsumerTransport, RebalanceListener, TransportRecord, TransportSession,
};
use crate::kafka::types::{CommitOffsetRange, OffsetRange, Partition, EPOCH_UNOWNED};
use crate::metrics_const::{
    ACKNOWLEDGEMENTS, ACKS_PENDING, COMMIT_FAILURES, CONSUME_ERRORS, DECODE_ERRORS,
    POLL_AUTH_ERRORS, RECORDS_COMMITTED, RECORDS_CONSUMED, SEEK_FAILURES, STALE_ACKS_DROPPED,
};

/// Offset and acknowledgement state shared between the consumer thread, the
/// rebalance callbacks, and downstream completion callbacks.
pub struct SourceState {
    ownership: OwnershipRegistry,
    /// Per-partition safe-commit reconstruction, created lazily and discarded
    /// on reassignment or reset.
    trackers: HashMap<Partition, PartitionCommitTracker>,
    /// Next offset to commit per partition, flushed in one batched call.
    offsets_to_commit: HashMap<Partition, i64>,
    /// Positively acknowledged batches waiting to be folded into trackers.
    acknowledged: Vec<HashMap<Partition, CommitOffsetRange>>,
    /// Partitions awaiting a seek back to their last committed offset.
    resets: HashSet<Partition>,
    last_commit: Instant,
    commit_interval: Duration,
    auto_commit: bool,
}

impl SourceState {
    pub fn new(commit_interval: Duration, auto_commit: bool) -> Self {
        Self {
            ownership: OwnershipRegistry::new(),
            trackers: HashMap::new(),
            offsets_to_commit: HashMap::new(),
            acknowledged: Vec::new(),
            resets: HashSet::new(),
            last_commit: Instant::now(),
            commit_interval,
            auto_commit,
        }
    }

    /// State plus the rebalance listener that mutates it, ready to wire into
    /// a transport.
    pub fn shared(
        commit_interval: Duration,
        auto_commit: bool,
    ) -> (Arc<Mutex<SourceState>>, Arc<OwnershipListener>) {
        let state = Arc::new(Mutex::new(SourceState::new(commit_interval, auto_commit)));
        let listener = Arc::new(OwnershipListener {
            state: Arc::clone(&state),
        });
        (state, listener)
    }

    pub fn epoch_of(&self, partition: &Partition) -> u64 {
        self.ownership.epoch_of(partition)
    }

    pub fn pending_commits(&self) -> &HashMap<Partition, i64> {
        &self.offsets_to_commit
    }

    pub fn tracker(&self, partition: &Partition) -> Option<&PartitionCommitTracker> {
        self.trackers.get(partition)
    }

    pub fn reset_queue(&self) -> &HashSet<Partition> {
        &self.resets
    }

    /// Called from a positive acknowledgement callback.
    pub fn queue_acknowledged(&mut self, offsets: HashMap<Partition, CommitOffsetRange>) {
        self.acknowledged.push(offsets);
    }

    /// Called from a negative acknowledgement callback.
    pub fn queue_resets(&mut self, partitions: impl IntoIterator<Item = Partition>) {
        self.resets.extend(partitions);
    }

    pub fn assign_partitions<S: TransportSession + ?Sized>(
        &mut self,
        session: &S,
        partitions: &[Partition],
    ) {
        for partition in self.ownership.assign(partitions) {
            // Offsets may have moved while the partition was owned elsewhere;
            // any leftover tracker state cannot be trusted.
            self.trackers.remove(&partition);
            match session.committed_offset(&partition) {
                Ok(committed) => {
                    info!(%partition, committed = committed.unwrap_or(0), "assigned partition")
                }
                Err(e) => {
                    warn!(%partition, error = %e, "assigned partition, committed offset unavailable")
                }
            }
        }
    }

    pub fn revoke_partitions<S: TransportSession + ?Sized>(
        &mut self,
        session: &S,
        partitions: &[Partition],
    ) {
        // Best-effort durability before ownership is gone.
        self.flush_commits(session, true);
        for partition in self.ownership.revoke(partitions) {
            self.trackers.remove(&partition);
            // If the forced flush failed these offsets now belong to another
            // owner; committing them later would be wrong.
            self.offsets_to_commit.remove(&partition);
        }
    }

    /// Record that everything up to (excluding) `next_offset` may be
    /// committed for `partition`.
    fn schedule_commit(&mut self, partition: Partition, next_offset: i64, records: i64) {
        metrics::counter!(RECORDS_COMMITTED).increment(records as u64);
        if self.auto_commit {
            return;
        }
        self.offsets_to_commit.insert(partition, next_offset);
    }

    /// Fold positively acknowledged ranges into their partition trackers,
    /// dropping any range whose ownership epoch is stale.
    fn process_acknowledged<S: TransportSession + ?Sized>(&mut self, session: &S) {
        if self.acknowledged.is_empty() {
            return;
        }
        for offsets in std::mem::take(&mut self.acknowledged) {
            for (partition, range) in offsets {
                if self.ownership.epoch_of(&partition) != range.epoch() {
                    debug!(%partition, "dropping completion from a superseded ownership session");
                    metrics::counter!(STALE_ACKS_DROPPED).increment(1);
                    continue;
                }
                let tracker = match self.trackers.entry(partition.clone()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => match session.committed_offset(&partition) {
                        Ok(committed) => {
                            info!(%partition, committed = committed.unwrap_or(0),
                                "tracking offsets from last committed offset");
                            entry.insert(PartitionCommitTracker::new(committed))
                        }
                        Err(e) => {
                            error!(%partition, error = %e,
                                "failed to seed commit tracker from committed offset");
                            continue;
                        }
                    },
                };
                if let Some(next_offset) = tracker.add_completed(range.offsets()) {
                    self.schedule_commit(partition, next_offset, range.offsets().count());
                }
            }
        }
    }

    /// Commit maintenance: drain acknowledged ranges, then flush the
    /// pending-commit map when forced or when the commit interval elapsed.
    /// A failed commit keeps the map for retry on the next cycle.
    pub fn flush_commits<S: TransportSession + ?Sized>(&mut self, session: &S, force: bool) {
        if self.auto_commit {
            return;
        }
        self.process_acknowledged(session);
        if !force && self.last_commit.elapsed() < self.commit_interval {
            return;
        }
        if self.offsets_to_commit.is_empty() {
            return;
        }
        match session.commit(&self.offsets_to_commit) {
            Ok(()) => {
                debug!(partitions = self.offsets_to_commit.len(), "committed offsets");
                self.offsets_to_commit.clear();
                self.last_commit = Instant::now();
            }
            Err(e) => {
                error!(error = %e, "failed to commit offsets, keeping them for retry");
                metrics::counter!(COMMIT_FAILURES).increment(1);
            }
        }
    }

    /// Seek negatively acknowledged partitions back to their last committed
    /// offset (or the log start) and drop their trackers. Failed seeks stay
    /// queued for the next cycle.
    pub fn drain_resets(&mut self, transport: &dyn ConsumerTransport) {
        if self.resets.is_empty() {
            return;
        }
        for partition in self.resets.clone() {
            let target = match transport.committed_offset(&partition) {
                Ok(Some(offset)) => offset,
                Ok(None) => 0,
                Err(e) => {
                    error!(%partition, error = %e,
                        "failed to fetch committed offset for reset, will retry");
                    metrics::counter!(SEEK_FAILURES).increment(1);
                    continue;
                }
            };
            match transport.seek(&partition, target) {
                Ok(()) => {
                    info!(%partition, offset = target, "reset partition after negative acknowledgement");
                    self.trackers.remove(&partition);
                    self.resets.remove(&partition);
                }
                Err(e) => {
                    error!(%partition, error = %e, "failed to seek partition for reset, will retry");
                    metrics::counter!(SEEK_FAILURES).increment(1);
                }
            }
        }
    }
}

/// Applies rebalance notifications to the shared state. Invoked inline on
/// the polling thread by the transport.
pub struct OwnershipListener {
    state: Arc<Mutex<SourceState>>,
}

impl RebalanceListener for OwnershipListener {
    fn on_partitions_assigned(&self, session: &dyn TransportSession, partitions: &[Partition]) {
        lock(&self.state).assign_partitions(session, partitions);
    }

    fn on_partitions_revoked(&self, session: &dyn TransportSession, partitions: &[Partition]) {
        lock(&self.state).revoke_partitions(session, partitions);
    }
}

fn lock(state: &Mutex<SourceState>) -> MutexGuard<'_, SourceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DecodedBatch {
    partition: Partition,
    epoch: u64,
    range: OffsetRange,
    events: Vec<IngestEvent>,
}

/// One consumer instance: polls the transport, decodes and enqueues records,
/// and maintains offset commits from downstream acknowledgements.
pub struct KafkaSourceConsumer {
    transport: Arc<dyn ConsumerTransport>,
    state: Arc<Mutex<SourceState>>,
    enqueuer: BackpressureEnqueuer,
    decoder: EventDecoder,
    /// `None` disables acknowledgements: batches are scheduled for commit as
    /// soon as they are enqueued.
    acks: Option<AckGroupManager>,
    config: ConsumerConfig,
    shutdown: Arc<AtomicBool>,
}

impl KafkaSourceConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn ConsumerTransport>,
        state: Arc<Mutex<SourceState>>,
        buffer: Arc<dyn EventBuffer>,
        decoder: EventDecoder,
        acks: Option<AckGroupManager>,
        config: ConsumerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let enqueuer = BackpressureEnqueuer::new(buffer, config.overflow_retry_delay);
        Self {
            transport,
            state,
            enqueuer,
            decoder,
            acks,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown flag is set.
    ///
    /// Starting: subscribe and stamp epochs for any immediately-assigned
    /// partitions. Running: each iteration drains resets, runs commit
    /// maintenance, then polls/decodes/enqueues. Any iteration error other
    /// than overflow moves the loop into a fixed backoff before the next
    /// iteration. Shutdown performs a final forced flush.
    pub fn run(&self) -> Result<()> {
        self.transport
            .subscribe(&self.config.topics)
            .with_context(|| format!("failed to subscribe to {:?}", self.config.topics))?;

        match self.transport.assignment() {
            Ok(assigned) if !assigned.is_empty() => {
                lock(&self.state).assign_partitions(&*self.transport, &assigned);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read initial assignment"),
        }

        info!(topics = ?self.config.topics, "starting kafka source consumer");
        let mut backing_off = false;
        while !self.shutdown.load(Ordering::Acquire) {
            if backing_off {
                std::thread::sleep(self.config.error_backoff);
            }
            match self.iterate() {
                Ok(()) => backing_off = false,
                Err(e) => {
                    error!(error = format!("{e:#}"), "consumer iteration failed, backing off");
                    metrics::counter!(CONSUME_ERRORS).increment(1);
                    backing_off = true;
                }
            }
        }

        info!("consumer shutting down, flushing pending commits");
        lock(&self.state).flush_commits(&*self.transport, true);
        Ok(())
    }

    pub fn iterate(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.drain_resets(&*self.transport);
            state.flush_commits(&*self.transport, false);
        } // release before the blocking poll
        self.consume_records()
    }

    fn consume_records(&self) -> Result<()> {
        let records = match self.transport.poll(self.config.poll_timeout) {
            Ok(records) => records,
            Err(e) if e.is_authentication() => {
                warn!(error = %e, "authentication error during poll, retrying after backoff");
                metrics::counter!(POLL_AUTH_ERRORS).increment(1);
                std::thread::sleep(self.config.auth_backoff);
                return Ok(());
            }
            Err(e) => return Err(e).context("transport poll failed"),
        };
        if records.is_empty() {
            return Ok(());
        }

        let batches = partition_batches(records);
        let rewind_points: Vec<(Partition, i64)> = batches
            .iter()
            .map(|(partition, records)| (partition.clone(), records[0].offset))
            .collect();
        let epochs: HashMap<Partition, u64> = {
            let state = lock(&self.state);
            batches
                .keys()
                .map(|partition| (partition.clone(), state.epoch_of(partition)))
                .collect()
        };

        // Decode the full batch before anything reaches the buffer: a schema
        // registry outage rewinds every partition rather than enqueueing half
        // a batch.
        let mut decoded = Vec::with_capacity(batches.len());
        for (partition, records) in batches {
            let epoch = epochs[&partition];
            if epoch == EPOCH_UNOWNED {
                info!(%partition, "skipping records for partition no longer owned");
                continue;
            }
            let range = OffsetRange::new(records[0].offset, records[records.len() - 1].offset);
            let mut events = Vec::with_capacity(records.len());
            for record in &records {
                match self.decoder.decode(record) {
                    Ok(event) => events.push(event),
                    Err(e) if e.is_schema_lookup() => {
                        warn!(error = %e, "schema lookup unavailable, rewinding batch");
                        metrics::counter!(DECODE_ERRORS, "reason" => "schema_lookup")
                            .increment(1);
                        return self.rewind_and_backoff(&rewind_points);
                    }
                    Err(e) => {
                        warn!(partition = %record.partition, offset = record.offset, error = %e,
                            "skipping record that failed to decode");
                        metrics::counter!(DECODE_ERRORS, "reason" => "malformed").increment(1);
                    }
                }
            }
            decoded.push(DecodedBatch {
                partition,
                epoch,
                range,
                events,
            });
        }
        if decoded.is_empty() {
            return Ok(());
        }

        // One completion group per poll batch, correlated with the offset
        // ranges read under the current epochs.
        let batch_offsets: Arc<Mutex<HashMap<Partition, CommitOffsetRange>>> = Arc::default();
        let group = self.acks.as_ref().map(|manager| {
            let offsets = Arc::clone(&batch_offsets);
            let state = Arc::clone(&self.state);
            manager.create(move |positive| {
                metrics::gauge!(ACKS_PENDING).decrement(1.0);
                let offsets = offsets.lock().unwrap_or_else(PoisonError::into_inner);
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if positive {
                    metrics::counter!(ACKNOWLEDGEMENTS, "status" => "positive").increment(1);
                    state.queue_acknowledged(offsets.clone());
                } else {
                    metrics::counter!(ACKNOWLEDGEMENTS, "status" => "negative").increment(1);
                    state.queue_resets(offsets.keys().cloned());
                }
            })
        });

        for batch in decoded {
            // Register the range before any of its records reach the buffer;
            // downstream may otherwise confirm a range the group never
            // recorded.
            batch_offsets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    batch.partition.clone(),
                    CommitOffsetRange::new(batch.range, batch.epoch),
                );

            let enqueued = batch.events.len();
            for event in batch.events {
                let ack = group.as_ref().map(|group| group.add());
                self.enqueuer.enqueue(BufferedRecord { event, ack });
            }
            metrics::counter!(RECORDS_CONSUMED).increment(enqueued as u64);

            if group.is_none() {
                // Acknowledgements disabled: the enqueued batch is eligible
                // for commit right away.
                lock(&self.state).schedule_commit(
                    batch.partition,
                    batch.range.max() + 1,
                    batch.range.count(),
                );
            }
        }

        if let Some(group) = group {
            group.complete();
            metrics::gauge!(ACKS_PENDING).increment(1.0);
        }
        Ok(())
    }

    /// Seek every partition of the failed batch back to its first offset so
    /// the whole batch is re-polled after the registry backoff.
    fn rewind_and_backoff(&self, rewind_points: &[(Partition, i64)]) -> Result<()> {
        for (partition, offset) in rewind_points {
            if let Err(e) = self.transport.seek(partition, *offset) {
                error!(%partition, error = %e, "failed to rewind partition after schema failure");
                metrics::counter!(SEEK_FAILURES).increment(1);
            }
        }
        std::thread::sleep(self.config.schema_backoff);
        Ok(())
    }
}

/// Group a poll result by partition, preserving the transport's per-partition
/// offset order.
fn partition_batches(records: Vec<TransportRecord>) -> BTreeMap<Partition, Vec<TransportRecord>> {
    let mut batches: BTreeMap<Partition, Vec<TransportRecord>> = BTreeMap::new();
    for record in records {
        batches
            .entry(record.partition.clone())
            .or_default()
            .push(record);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::buffer::InMemoryBuffer;
    use crate::kafka::decode::{
        EventDecoder, KeyMode, MessageFormat, SchemaLookupError, SchemaProvider,
    };
    use crate::kafka::test_utils::{json_records, record, MockTransport};
    use crate::kafka::transport::TransportError;
    use tokio::runtime::Handle;

    struct Harness {
        transport: Arc<MockTransport>,
        state: Arc<Mutex<SourceState>>,
        buffer: Arc<InMemoryBuffer>,
        consumer: KafkaSourceConsumer,
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig::new(vec!["events".to_string()])
            .with_commit_interval(Duration::ZERO)
            .with_error_backoff(Duration::from_millis(1))
            .with_auth_backoff(Duration::from_millis(1))
            .with_schema_backoff(Duration::from_millis(1))
    }

    fn harness(acks_enabled: bool) -> Harness {
        harness_with(acks_enabled, test_config(), json_decoder(), false)
    }

    fn harness_with(
        acks_enabled: bool,
        config: ConsumerConfig,
        decoder: EventDecoder,
        auto_commit: bool,
    ) -> Harness {
        let transport = MockTransport::new();
        let (state, listener) = SourceState::shared(config.commit_interval, auto_commit);
        transport.set_listener(listener);
        let buffer = Arc::new(InMemoryBuffer::new(64));
        let acks = acks_enabled.then(|| AckGroupManager::new(Handle::current(), None));
        let consumer = KafkaSourceConsumer::new(
            transport.clone(),
            Arc::clone(&state),
            buffer.clone(),
            decoder,
            acks,
            config,
            Arc::new(AtomicBool::new(false)),
        );
        Harness {
            transport,
            state,
            buffer,
            consumer,
        }
    }

    fn json_decoder() -> EventDecoder {
        EventDecoder::new(MessageFormat::Json, KeyMode::Discard, None)
    }

    fn p0() -> Partition {
        Partition::new("events", 0)
    }

    fn drain(buffer: &InMemoryBuffer) -> Vec<BufferedRecord> {
        std::iter::from_fn(|| buffer.pop()).collect()
    }

    fn ack_all(records: Vec<BufferedRecord>) {
        for record in records {
            if let Some(ack) = record.ack {
                ack.ack();
            }
        }
    }

    fn nack_all(records: Vec<BufferedRecord>) {
        for record in records {
            if let Some(ack) = record.ack {
                ack.nack();
            }
        }
    }

    #[tokio::test]
    async fn acknowledged_batches_advance_commits_end_to_end() {
        let h = harness(true);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=12));
        h.transport.push_records(json_records(&p0, 13..=14));

        h.consumer.iterate().unwrap(); // assignment
        h.consumer.iterate().unwrap(); // first batch enqueued
        ack_all(drain(&h.buffer));
        h.consumer.iterate().unwrap(); // commits [10,12], polls second batch
        ack_all(drain(&h.buffer));
        h.consumer.iterate().unwrap(); // commits [13,14]

        let commits = h.transport.commits();
        assert_eq!(commits.len(), 2, "expected two commit advances");
        assert_eq!(commits[0][&p0], 13);
        assert_eq!(commits[1][&p0], 15);
        assert_eq!(h.transport.committed(&p0), Some(15));

        let state = h.state.lock().unwrap();
        assert_eq!(state.tracker(&p0).unwrap().pending_ranges(), 0);
        assert!(state.pending_commits().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_acknowledgements_hold_the_commit_until_the_gap_fills() {
        let h = harness(true);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=11));
        h.transport.push_records(json_records(&p0, 12..=13));

        h.consumer.iterate().unwrap(); // assignment
        h.consumer.iterate().unwrap(); // batch [10,11]
        let first_batch = drain(&h.buffer);
        h.consumer.iterate().unwrap(); // batch [12,13]
        let second_batch = drain(&h.buffer);

        // Later batch confirms first: nothing is committable yet.
        ack_all(second_batch);
        h.consumer.iterate().unwrap();
        assert!(h.transport.commits().is_empty());

        ack_all(first_batch);
        h.consumer.iterate().unwrap();
        assert_eq!(h.transport.commits(), vec![HashMap::from([(p0, 14)])]);
    }

    #[tokio::test]
    async fn stale_epoch_completion_does_not_touch_the_tracker() {
        let h = harness(true);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=12));
        h.transport.push_revoke(vec![p0.clone()]);
        h.transport.push_assign(vec![p0.clone()]);

        h.consumer.iterate().unwrap(); // assignment, epoch E
        h.consumer.iterate().unwrap(); // batch read under epoch E
        let stale_batch = drain(&h.buffer);
        h.consumer.iterate().unwrap(); // revoke
        h.consumer.iterate().unwrap(); // re-assign, epoch E+1

        // The acknowledgement arrives from the superseded session.
        ack_all(stale_batch);
        h.consumer.iterate().unwrap();

        let state = h.state.lock().unwrap();
        assert!(state.tracker(&p0).is_none());
        assert!(state.pending_commits().is_empty());
        assert!(h.transport.commits().is_empty());
    }

    #[tokio::test]
    async fn negative_acknowledgement_resets_to_the_committed_offset() {
        let h = harness(true);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=12));

        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();
        nack_all(drain(&h.buffer));

        {
            let state = h.state.lock().unwrap();
            assert!(state.reset_queue().contains(&p0));
        }

        h.consumer.iterate().unwrap();
        assert_eq!(h.transport.seeks(), vec![(p0.clone(), 10)]);
        let state = h.state.lock().unwrap();
        assert!(state.reset_queue().is_empty());
        assert!(state.tracker(&p0).is_none());
        assert!(h.transport.commits().is_empty());
    }

    #[tokio::test]
    async fn reset_without_committed_offset_seeks_to_zero() {
        let h = harness(true);
        let p0 = p0();
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 0..=1));

        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();
        nack_all(drain(&h.buffer));
        h.consumer.iterate().unwrap();

        assert_eq!(h.transport.seeks(), vec![(p0, 0)]);
    }

    #[tokio::test]
    async fn failed_seek_keeps_the_partition_queued_for_reset() {
        let h = harness(true);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=10));

        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();
        nack_all(drain(&h.buffer));

        h.transport.fail_seeks(true);
        h.consumer.iterate().unwrap();
        assert!(h.state.lock().unwrap().reset_queue().contains(&p0));

        h.transport.fail_seeks(false);
        h.consumer.iterate().unwrap();
        assert!(h.state.lock().unwrap().reset_queue().is_empty());
        assert_eq!(h.transport.seeks(), vec![(p0, 10)]);
    }

    #[test]
    fn revocation_flushes_pending_commits_before_clearing_ownership() {
        // Long commit interval so only the forced revocation flush commits.
        let config = test_config().with_commit_interval(Duration::from_secs(3600));
        let h = harness_with(false, config, json_decoder(), false);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=12));
        h.transport.push_revoke(vec![p0.clone()]);

        h.consumer.iterate().unwrap(); // assignment
        h.consumer.iterate().unwrap(); // batch, scheduled for commit
        assert!(h.transport.commits().is_empty());

        h.consumer.iterate().unwrap(); // revoke fires inside poll
        assert_eq!(h.transport.commits(), vec![HashMap::from([(p0.clone(), 13)])]);

        let state = h.state.lock().unwrap();
        assert_eq!(state.epoch_of(&p0), EPOCH_UNOWNED);
        assert!(state.pending_commits().is_empty());
    }

    #[test]
    fn records_for_unowned_partitions_are_skipped() {
        let h = harness(false);
        let p0 = p0();
        // No assignment for p0: ownership was lost before processing.
        h.transport.push_records(json_records(&p0, 10..=12));

        h.consumer.iterate().unwrap();
        assert!(h.buffer.is_empty());
        assert!(h.state.lock().unwrap().pending_commits().is_empty());
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_without_stalling_the_batch() {
        let h = harness(true);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(vec![
            record(&p0, 10, r#"{"offset": 10}"#),
            record(&p0, 11, "{not json"),
            record(&p0, 12, r#"{"offset": 12}"#),
        ]);

        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();
        let enqueued = drain(&h.buffer);
        assert_eq!(enqueued.len(), 2, "bad record must not reach the buffer");

        // The batch range still covers the skipped offset.
        ack_all(enqueued);
        h.consumer.iterate().unwrap();
        assert_eq!(h.transport.committed(&p0), Some(13));
    }

    #[test]
    fn schema_lookup_outage_rewinds_the_whole_batch() {
        struct DownRegistry;
        impl SchemaProvider for DownRegistry {
            fn schema_for(&self, topic: &str) -> Result<String, SchemaLookupError> {
                Err(SchemaLookupError {
                    topic: topic.to_string(),
                    message: "registry unreachable".to_string(),
                })
            }
        }
        let decoder = EventDecoder::new(
            MessageFormat::Avro,
            KeyMode::Discard,
            Some(Arc::new(DownRegistry)),
        );
        let h = harness_with(false, test_config(), decoder, false);
        let p0 = p0();
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=12));

        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();

        assert!(h.buffer.is_empty(), "no partial batch may be enqueued");
        assert_eq!(h.transport.seeks(), vec![(p0, 10)]);
    }

    #[test]
    fn disabled_acknowledgements_commit_as_soon_as_the_batch_is_enqueued() {
        let h = harness(false);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=12));

        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();
        assert_eq!(h.state.lock().unwrap().pending_commits()[&p0], 13);

        // Records sit in the buffer unacknowledged, yet the commit flushes.
        h.consumer.iterate().unwrap();
        assert_eq!(h.transport.committed(&p0), Some(13));
        assert_eq!(h.buffer.len(), 3);
    }

    #[test]
    fn auto_commit_mode_performs_no_manual_commits() {
        let h = harness_with(false, test_config(), json_decoder(), true);
        let p0 = p0();
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=12));

        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();

        assert!(h.transport.commits().is_empty());
        assert!(h.state.lock().unwrap().pending_commits().is_empty());
    }

    #[test]
    fn failed_commit_keeps_offsets_for_the_next_cycle() {
        let h = harness(false);
        let p0 = p0();
        h.transport.set_committed(p0.clone(), 10);
        h.transport.push_assign(vec![p0.clone()]);
        h.transport.push_records(json_records(&p0, 10..=12));

        h.consumer.iterate().unwrap();
        h.consumer.iterate().unwrap();

        h.transport.fail_commits(true);
        h.consumer.iterate().unwrap();
        assert!(h.transport.commits().is_empty());
        assert_eq!(h.state.lock().unwrap().pending_commits()[&p0], 13);

        h.transport.fail_commits(false);
        h.consumer.iterate().unwrap();
        assert_eq!(h.transport.committed(&p0), Some(13));
        assert!(h.state.lock().unwrap().pending_commits().is_empty());
    }

    #[test]
    fn authentication_failure_is_retried_not_fatal() {
        let h = harness(false);
        h.transport
            .push_failure(TransportError::Authentication("sasl handshake".into()));
        assert!(h.consumer.iterate().is_ok());
    }

    #[test]
    fn other_poll_failures_surface_as_iteration_errors() {
        let h = harness(false);
        h.transport
            .push_failure(TransportError::Poll("broker went away".into()));
        assert!(h.consumer.iterate().is_err());
    }
}
