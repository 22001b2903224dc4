//! Downstream buffer seam and the backpressure-aware enqueuer.
//!
//! The pipeline's bounded buffer is external; this module defines the trait
//! the consumer pushes into plus an in-memory implementation used by the
//! binary's drain task and by tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::kafka::acks::AckHandle;
use crate::kafka::decode::IngestEvent;
use crate::metrics_const::BUFFER_OVERFLOWS;

/// A decoded event travelling through the buffer, with the acknowledgement
/// handle downstream must release once the event is fully processed. `None`
/// when acknowledgements are disabled.
#[derive(Debug)]
pub struct BufferedRecord {
    pub event: IngestEvent,
    pub ack: Option<AckHandle>,
}

#[derive(Debug, Error)]
pub enum BufferError {
    /// The buffer is at capacity; the rejected record is handed back so the
    /// caller can retry it.
    #[error("downstream buffer is full")]
    Overflow(BufferedRecord),
}

pub trait EventBuffer: Send + Sync {
    fn try_add(&self, record: BufferedRecord) -> Result<(), BufferError>;
}

/// Bounded in-memory buffer.
pub struct InMemoryBuffer {
    capacity: usize,
    records: Mutex<VecDeque<BufferedRecord>>,
}

impl InMemoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn pop(&self) -> Option<BufferedRecord> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<BufferedRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventBuffer for InMemoryBuffer {
    fn try_add(&self, record: BufferedRecord) -> Result<(), BufferError> {
        let mut records = self.lock();
        if records.len() >= self.capacity {
            return Err(BufferError::Overflow(record));
        }
        records.push_back(record);
        Ok(())
    }
}

/// Pushes records into the buffer, retrying under overflow.
///
/// The retry is deliberately unbounded: a full buffer means downstream is
/// saturated and the consumer must stall rather than drop. Every overflow
/// bumps a counter so the stall is visible.
pub struct BackpressureEnqueuer {
    buffer: Arc<dyn EventBuffer>,
    retry_delay: Duration,
}

impl BackpressureEnqueuer {
    pub fn new(buffer: Arc<dyn EventBuffer>, retry_delay: Duration) -> Self {
        Self {
            buffer,
            retry_delay,
        }
    }

    /// Blocks until the record is accepted. Never drops.
    pub fn enqueue(&self, record: BufferedRecord) {
        let mut record = record;
        loop {
            match self.buffer.try_add(record) {
                Ok(()) => return,
                Err(BufferError::Overflow(rejected)) => {
                    metrics::counter!(BUFFER_OVERFLOWS).increment(1);
                    debug!("downstream buffer full, retrying");
                    record = rejected;
                    std::thread::sleep(self.retry_delay);
                }
            }
        }
    }
}
