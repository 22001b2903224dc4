//! Scripted transport double used by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::kafka::transport::{
    ConsumerTransport, RebalanceListener, TransportError, TransportRecord, TransportSession,
};
use crate::kafka::types::Partition;

/// One scripted poll outcome. Rebalance events fire their listener callbacks
/// from inside `poll`, the way the real transport does.
pub enum PollScript {
    Records(Vec<TransportRecord>),
    Assign(Vec<Partition>),
    Revoke(Vec<Partition>),
    Fail(TransportError),
}

#[derive(Default)]
struct MockInner {
    script: VecDeque<PollScript>,
    committed: HashMap<Partition, i64>,
    commits: Vec<HashMap<Partition, i64>>,
    seeks: Vec<(Partition, i64)>,
    subscriptions: Vec<String>,
    assignment: Vec<Partition>,
    fail_commits: bool,
    fail_seeks: bool,
    woken: bool,
}

#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<MockInner>,
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_listener(&self, listener: Arc<dyn RebalanceListener>) {
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn push_records(&self, records: Vec<TransportRecord>) {
        self.inner_mut().script.push_back(PollScript::Records(records));
    }

    pub fn push_assign(&self, partitions: Vec<Partition>) {
        self.inner_mut()
            .script
            .push_back(PollScript::Assign(partitions));
    }

    pub fn push_revoke(&self, partitions: Vec<Partition>) {
        self.inner_mut()
            .script
            .push_back(PollScript::Revoke(partitions));
    }

    pub fn push_failure(&self, error: TransportError) {
        self.inner_mut().script.push_back(PollScript::Fail(error));
    }

    /// Seed the broker-side committed offset (next offset to consume).
    pub fn set_committed(&self, partition: Partition, next_offset: i64) {
        self.inner_mut().committed.insert(partition, next_offset);
    }

    pub fn set_assignment(&self, partitions: Vec<Partition>) {
        self.inner_mut().assignment = partitions;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.inner_mut().fail_commits = fail;
    }

    pub fn fail_seeks(&self, fail: bool) {
        self.inner_mut().fail_seeks = fail;
    }

    /// Batched commit calls observed so far.
    pub fn commits(&self) -> Vec<HashMap<Partition, i64>> {
        self.inner_mut().commits.clone()
    }

    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.inner_mut().committed.get(partition).copied()
    }

    pub fn seeks(&self) -> Vec<(Partition, i64)> {
        self.inner_mut().seeks.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner_mut().subscriptions.clone()
    }

    pub fn script_exhausted(&self) -> bool {
        self.inner_mut().script.is_empty()
    }

    pub fn was_woken(&self) -> bool {
        self.inner_mut().woken
    }

    fn inner_mut(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_listener(&self) -> Option<Arc<dyn RebalanceListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TransportSession for MockTransport {
    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), TransportError> {
        let mut inner = self.inner_mut();
        if inner.fail_commits {
            return Err(TransportError::Commit("injected commit failure".into()));
        }
        inner.commits.push(offsets.clone());
        for (partition, next_offset) in offsets {
            inner.committed.insert(partition.clone(), *next_offset);
        }
        Ok(())
    }

    fn committed_offset(&self, partition: &Partition) -> Result<Option<i64>, TransportError> {
        Ok(self.inner_mut().committed.get(partition).copied())
    }
}

impl ConsumerTransport for MockTransport {
    fn poll(&self, timeout: Duration) -> Result<Vec<TransportRecord>, TransportError> {
        // Take the next script entry without holding the lock across the
        // listener callback; the callback calls back into this transport.
        let entry = self.inner_mut().script.pop_front();
        match entry {
            None => {
                // Simulate a blocking poll with nothing to deliver, capped so
                // tests stay fast.
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                Ok(Vec::new())
            }
            Some(PollScript::Records(records)) => Ok(records),
            Some(PollScript::Fail(error)) => Err(error),
            Some(PollScript::Assign(partitions)) => {
                self.inner_mut().assignment.extend(partitions.clone());
                if let Some(listener) = self.current_listener() {
                    listener.on_partitions_assigned(self, &partitions);
                }
                Ok(Vec::new())
            }
            Some(PollScript::Revoke(partitions)) => {
                self.inner_mut()
                    .assignment
                    .retain(|p| !partitions.contains(p));
                if let Some(listener) = self.current_listener() {
                    listener.on_partitions_revoked(self, &partitions);
                }
                Ok(Vec::new())
            }
        }
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), TransportError> {
        let mut inner = self.inner_mut();
        if inner.fail_seeks {
            return Err(TransportError::Seek {
                partition: partition.clone(),
                offset,
                message: "injected seek failure".into(),
            });
        }
        inner.seeks.push((partition.clone(), offset));
        Ok(())
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.inner_mut().subscriptions.extend_from_slice(topics);
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, TransportError> {
        Ok(self.inner_mut().assignment.clone())
    }

    fn wake(&self) {
        self.inner_mut().woken = true;
    }
}

/// Record builder for tests.
pub fn record(partition: &Partition, offset: i64, payload: &str) -> TransportRecord {
    TransportRecord {
        partition: partition.clone(),
        offset,
        key: None,
        payload: Some(payload.as_bytes().to_vec()),
    }
}

/// A run of JSON records on one partition covering `offsets`.
pub fn json_records(
    partition: &Partition,
    offsets: std::ops::RangeInclusive<i64>,
) -> Vec<TransportRecord> {
    offsets
        .map(|offset| record(partition, offset, &format!(r#"{{"offset": {offset}}}"#)))
        .collect()
}
