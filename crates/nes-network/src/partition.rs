//! Which partitions this node consumes and produces.

use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::exchange::ExchangeListener;
use crate::protocol::{NesPartition, NodeLocation};
use crate::NetworkError;

/// Outcome of a consumer lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRegistrationStatus {
    /// A consumer is registered.
    Registered,
    /// Nothing is known about the partition.
    NotFound,
    /// A consumer was registered and has been removed.
    Deleted,
}

struct ConsumerEntry {
    refcount: u64,
    listener: Arc<dyn ExchangeListener>,
}

struct ProducerEntry {
    refcount: u64,
    location: NodeLocation,
}

#[derive(Default)]
struct Partitions {
    consumers: FxHashMap<NesPartition, ConsumerEntry>,
    producers: FxHashMap<NesPartition, ProducerEntry>,
    deleted: FxHashSet<NesPartition>,
}

/// Registry of consumer and producer partitions.
///
/// A consumer entry counts its registration plus every connection pinned to
/// it; it is removed (and remembered as deleted) when the count drops to 0.
/// Producer entries count the local producers sharing one outbound channel.
#[derive(Default)]
pub struct PartitionManager {
    inner: Mutex<Partitions>,
    registered: Notify,
}

impl PartitionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the consumer of `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::DuplicatePartition`] while another consumer
    /// of the partition is registered.
    pub fn register_subpartition_consumer(
        &self,
        partition: NesPartition,
        listener: Arc<dyn ExchangeListener>,
    ) -> Result<(), NetworkError> {
        {
            let mut inner = self.inner.lock();
            if inner.consumers.contains_key(&partition) {
                return Err(NetworkError::DuplicatePartition(partition));
            }
            inner.deleted.remove(&partition);
            inner.consumers.insert(
                partition,
                ConsumerEntry {
                    refcount: 1,
                    listener,
                },
            );
        }
        info!(%partition, "consumer partition registered");
        self.registered.notify_waiters();
        Ok(())
    }

    /// Adds a reference for a connection delivering into `partition`.
    ///
    /// Returns false if no consumer is registered.
    pub fn pin_consumer(&self, partition: NesPartition) -> bool {
        let mut inner = self.inner.lock();
        match inner.consumers.get_mut(&partition) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one reference of `partition`. Returns true if the entry was
    /// removed.
    pub fn unregister_subpartition_consumer(&self, partition: NesPartition) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.consumers.get_mut(&partition) else {
            return false;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return false;
        }
        inner.consumers.remove(&partition);
        inner.deleted.insert(partition);
        debug!(%partition, "consumer partition removed");
        true
    }

    /// Registration state of the consumer of `partition`.
    #[must_use]
    pub fn get_consumer_registration_status(
        &self,
        partition: NesPartition,
    ) -> PartitionRegistrationStatus {
        let inner = self.inner.lock();
        if inner.consumers.contains_key(&partition) {
            PartitionRegistrationStatus::Registered
        } else if inner.deleted.contains(&partition) {
            PartitionRegistrationStatus::Deleted
        } else {
            PartitionRegistrationStatus::NotFound
        }
    }

    /// Listener of the consumer of `partition`.
    #[must_use]
    pub fn get_consumer_listener(&self, partition: NesPartition) -> Option<Arc<dyn ExchangeListener>> {
        self.inner
            .lock()
            .consumers
            .get(&partition)
            .map(|entry| Arc::clone(&entry.listener))
    }

    /// Current reference count of the consumer of `partition`.
    #[must_use]
    pub fn consumer_refcount(&self, partition: NesPartition) -> Option<u64> {
        self.inner.lock().consumers.get(&partition).map(|e| e.refcount)
    }

    /// Registers a local producer of `partition` sending to `location`.
    /// Returns the new reference count.
    pub fn register_subpartition_producer(
        &self,
        partition: NesPartition,
        location: NodeLocation,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let entry = inner
            .producers
            .entry(partition)
            .or_insert(ProducerEntry {
                refcount: 0,
                location,
            });
        entry.refcount += 1;
        entry.refcount
    }

    /// Drops one producer reference. Returns true if it was the last one.
    pub fn unregister_subpartition_producer(&self, partition: NesPartition) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.producers.get_mut(&partition) else {
            return false;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return false;
        }
        inner.producers.remove(&partition);
        true
    }

    /// Points the producers of `partition` at a new receiver.
    pub fn update_producer_location(&self, partition: NesPartition, location: NodeLocation) {
        if let Some(entry) = self.inner.lock().producers.get_mut(&partition) {
            entry.location = location;
        }
    }

    /// Receiver of `partition`, if a local producer is registered.
    #[must_use]
    pub fn producer_location(&self, partition: NesPartition) -> Option<NodeLocation> {
        self.inner
            .lock()
            .producers
            .get(&partition)
            .map(|e| e.location.clone())
    }

    /// Current reference count of the producers of `partition`.
    #[must_use]
    pub fn producer_refcount(&self, partition: NesPartition) -> Option<u64> {
        self.inner.lock().producers.get(&partition).map(|e| e.refcount)
    }

    /// Signalled whenever a consumer registers.
    #[must_use]
    pub fn registrations(&self) -> &Notify {
        &self.registered
    }
}

impl std::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PartitionManager")
            .field("consumers", &inner.consumers.len())
            .field("producers", &inner.producers.len())
            .field("deleted", &inner.deleted.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nes_core::buffer::TupleBuffer;
    use nes_core::engine::QueryTerminationType;
    use nes_core::ids::{NodeId, OperatorId, QueryId};

    struct Ignore;

    impl ExchangeListener for Ignore {
        fn on_data_buffer(&self, _: NesPartition, _: TupleBuffer) {}
        fn on_end_of_stream(&self, _: NesPartition, _: QueryTerminationType) {}
    }

    fn partition(sub: u64) -> NesPartition {
        NesPartition::new(QueryId(1), OperatorId(1), 0, sub)
    }

    #[test]
    fn test_duplicate_consumer_rejected() {
        let manager = PartitionManager::new();
        manager.register_subpartition_consumer(partition(0), Arc::new(Ignore)).unwrap();
        assert!(matches!(
            manager.register_subpartition_consumer(partition(0), Arc::new(Ignore)),
            Err(NetworkError::DuplicatePartition(p)) if p == partition(0)
        ));
        manager.register_subpartition_consumer(partition(1), Arc::new(Ignore)).unwrap();
    }

    #[test]
    fn test_consumer_refcount_and_deleted_status() {
        let manager = PartitionManager::new();
        let p = partition(0);
        assert_eq!(manager.get_consumer_registration_status(p), PartitionRegistrationStatus::NotFound);
        manager.register_subpartition_consumer(p, Arc::new(Ignore)).unwrap();
        assert!(manager.pin_consumer(p));
        assert_eq!(manager.consumer_refcount(p), Some(2));

        assert!(!manager.unregister_subpartition_consumer(p));
        assert_eq!(manager.get_consumer_registration_status(p), PartitionRegistrationStatus::Registered);
        assert!(manager.unregister_subpartition_consumer(p));
        assert_eq!(manager.get_consumer_registration_status(p), PartitionRegistrationStatus::Deleted);
        assert!(!manager.pin_consumer(p));

        // Registering again clears the deleted mark.
        manager.register_subpartition_consumer(p, Arc::new(Ignore)).unwrap();
        assert_eq!(manager.get_consumer_registration_status(p), PartitionRegistrationStatus::Registered);
    }

    #[test]
    fn test_producers_are_shared() {
        let manager = PartitionManager::new();
        let p = partition(0);
        let location = NodeLocation::new(NodeId(2), "localhost", 1);
        assert_eq!(manager.register_subpartition_producer(p, location.clone()), 1);
        assert_eq!(manager.register_subpartition_producer(p, location.clone()), 2);
        assert!(!manager.unregister_subpartition_producer(p));
        assert_eq!(manager.producer_location(p), Some(location));
        assert!(manager.unregister_subpartition_producer(p));
        assert_eq!(manager.producer_refcount(p), None);
        assert!(!manager.unregister_subpartition_producer(p));
    }
}
