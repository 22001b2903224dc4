//! Partition ownership epochs.
//!
//! Every (re)assignment of a partition stamps a fresh epoch; epoch 0 means
//! "not owned". Acknowledgement completions carry the epoch they were read
//! under, and any completion whose epoch no longer matches the table belongs
//! to a superseded ownership session and is dropped at application time.

use std::collections::HashMap;

use tracing::info;

use crate::kafka::types::{epoch_now, Partition, EPOCH_UNOWNED};

#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    epochs: HashMap<Partition, u64>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a fresh epoch for each partition we do not already own and
    /// return the partitions that are actually new. Duplicate assignment
    /// notifications for owned partitions are a no-op.
    pub fn assign(&mut self, partitions: &[Partition]) -> Vec<Partition> {
        let epoch = epoch_now();
        let mut newly_owned = Vec::new();
        for partition in partitions {
            if self.epochs.contains_key(partition) {
                info!(%partition, "partition already owned, ignoring assignment");
                continue;
            }
            self.epochs.insert(partition.clone(), epoch);
            newly_owned.push(partition.clone());
        }
        newly_owned
    }

    /// Clear the epoch for each owned partition in `partitions`, returning
    /// the ones that were actually owned.
    pub fn revoke(&mut self, partitions: &[Partition]) -> Vec<Partition> {
        let mut released = Vec::new();
        for partition in partitions {
            if self.epochs.remove(partition).is_some() {
                info!(%partition, "revoked partition");
                released.push(partition.clone());
            } else {
                info!(%partition, "partition not owned, ignoring revocation");
            }
        }
        released
    }

    /// Current epoch for a partition, `EPOCH_UNOWNED` (0) if we don't own it.
    pub fn epoch_of(&self, partition: &Partition) -> u64 {
        self.epochs.get(partition).copied().unwrap_or(EPOCH_UNOWNED)
    }

    pub fn is_owned(&self, partition: &Partition) -> bool {
        self.epoch_of(partition) != EPOCH_UNOWNED
    }

    pub fn owned_count(&self) -> usize {
        self.epochs.len()
    }
}
