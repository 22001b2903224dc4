//! Acknowledgement groups.
//!
//! One group is opened per poll batch. Every record handed downstream takes
//! an [`AckHandle`] out of the group; the group's completion callback fires
//! exactly once, after the group is sealed with [`AckGroup::complete`] and
//! every handle has been released (or the optional timeout watchdog trips).
//! Releases happen on arbitrary downstream threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::warn;

type CompletionFn = Box<dyn FnOnce(bool) + Send + 'static>;

struct GroupState {
    /// Handles taken out of the group and not yet released.
    outstanding: AtomicUsize,
    /// Set by `complete()`; the callback may only fire once this is true.
    sealed: AtomicBool,
    /// Any single negative release poisons the whole group.
    negative: AtomicBool,
    /// Taken exactly once, by whichever thread observes the terminal state
    /// first (or by the timeout watchdog).
    on_complete: Mutex<Option<CompletionFn>>,
}

impl GroupState {
    fn try_fire(&self, outcome: bool) {
        let callback = self
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    fn release(&self, success: bool) {
        if !success {
            self.negative.store(true, Ordering::Release);
        }
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
            && self.sealed.load(Ordering::Acquire)
        {
            self.try_fire(!self.negative.load(Ordering::Acquire));
        }
    }
}

/// A completion group for one poll batch.
pub struct AckGroup {
    state: Arc<GroupState>,
}

impl AckGroup {
    /// Take a handle for one record. Must happen before the record is handed
    /// downstream, otherwise the group could observe completion of a record
    /// it never counted.
    pub fn add(&self) -> AckHandle {
        debug_assert!(
            !self.state.sealed.load(Ordering::Acquire),
            "handle taken from a sealed acknowledgement group"
        );
        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        AckHandle {
            state: Arc::clone(&self.state),
            released: false,
        }
    }

    /// Seal the group: no further handles will be added. If everything was
    /// already released (including the empty-group case) the callback fires
    /// here, on the caller's thread.
    pub fn complete(self) {
        self.state.sealed.store(true, Ordering::Release);
        if self.state.outstanding.load(Ordering::Acquire) == 0 {
            self.state
                .try_fire(!self.state.negative.load(Ordering::Acquire));
        }
    }
}

/// Release handle for a single record, carried alongside it through the
/// downstream buffer.
pub struct AckHandle {
    state: Arc<GroupState>,
    released: bool,
}

impl AckHandle {
    /// Confirm successful processing.
    pub fn ack(mut self) {
        self.released = true;
        self.state.release(true);
    }

    /// Report failed processing; the whole group completes negatively.
    pub fn nack(mut self) {
        self.released = true;
        self.state.release(false);
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if !self.released {
            warn!("acknowledgement handle dropped without release, treating as negative");
            self.state.release(false);
        }
    }
}

/// Creates acknowledgement groups, optionally arming a timeout watchdog that
/// completes a group negatively if downstream never confirms it.
pub struct AckGroupManager {
    runtime: Handle,
    timeout: Option<Duration>,
}

impl AckGroupManager {
    pub fn new(runtime: Handle, timeout: Option<Duration>) -> Self {
        Self { runtime, timeout }
    }

    pub fn create(&self, on_complete: impl FnOnce(bool) + Send + 'static) -> AckGroup {
        let state = Arc::new(GroupState {
            outstanding: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            negative: AtomicBool::new(false),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        });

        if let Some(timeout) = self.timeout {
            let watchdog = Arc::clone(&state);
            self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                // No-op if the group already completed: the callback is gone.
                watchdog.try_fire(false);
            });
        }

        AckGroup { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> AckGroupManager {
        AckGroupManager::new(Handle::current(), None)
    }

    fn outcome_probe() -> (Arc<Mutex<Vec<bool>>>, impl FnOnce(bool) + Send) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let probe = Arc::clone(&outcomes);
        (outcomes, move |result: bool| {
            probe.lock().unwrap().push(result)
        })
    }

    #[tokio::test]
    async fn completes_positively_after_seal_and_all_acks() {
        let (outcomes, on_complete) = outcome_probe();
        let group = manager().create(on_complete);

        let first = group.add();
        let second = group.add();
        first.ack();
        group.complete();
        assert!(outcomes.lock().unwrap().is_empty(), "one handle still out");

        second.ack();
        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn any_nack_poisons_the_outcome() {
        let (outcomes, on_complete) = outcome_probe();
        let group = manager().create(on_complete);

        let first = group.add();
        let second = group.add();
        first.nack();
        second.ack();
        group.complete();

        assert_eq!(*outcomes.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn empty_group_completes_on_seal() {
        let (outcomes, on_complete) = outcome_probe();
        manager().create(on_complete).complete();
        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_negative() {
        let (outcomes, on_complete) = outcome_probe();
        let group = manager().create(on_complete);

        let handle = group.add();
        group.complete();
        drop(handle);

        assert_eq!(*outcomes.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn callback_fires_exactly_once_under_concurrent_release() {
        let fired = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&fired);
        let group = manager().create(move |_| {
            probe.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..16).map(|_| group.add()).collect();
        group.complete();

        let mut threads = Vec::new();
        for handle in handles {
            threads.push(std::thread::spawn(move || handle.ack()));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_watchdog_completes_negatively() {
        let (outcomes, on_complete) = outcome_probe();
        let manager = AckGroupManager::new(Handle::current(), Some(Duration::from_millis(10)));
        let group = manager.create(on_complete);

        let handle = group.add();
        group.complete();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*outcomes.lock().unwrap(), vec![false]);

        // A late release after expiry must not fire the callback again.
        handle.ack();
        assert_eq!(*outcomes.lock().unwrap(), vec![false]);
    }
}
