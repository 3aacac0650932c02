use crate::registry::{ActiveFileKey, ActiveFileRegistry, Oid, FIRST_USER_OBJECT_ID};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Low-level storage lifecycle events observed by the detectors. Create,
/// extend, and truncate all mean the same thing here: the file's size is
/// suspect and worth re-measuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMutationKind {
    Create,
    Extend,
    Truncate,
    Unlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMutationEvent {
    pub kind: FileMutationKind,
    pub file: ActiveFileKey,
}

/// Coarser object-lifecycle event class carrying table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAccessKind {
    PostCreate,
    PostAlter,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Relation,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAccessEvent {
    pub access: ObjectAccessKind,
    pub class: ObjectClass,
    pub object_id: Oid,
    pub sub_id: u32,
    pub database_id: Oid,
}

pub trait FileMutationObserver: Send + Sync {
    fn on_file_mutation(&self, event: &FileMutationEvent);
}

pub trait ObjectAccessObserver: Send + Sync {
    fn on_object_access(&self, event: &ObjectAccessEvent);
}

/// Ordered observer lists for both event classes. Observers run in install
/// order, so anything registered before a detector always sees the event
/// first; installing never replaces an earlier handler.
#[derive(Default)]
pub struct StorageHookChain {
    file_observers: Vec<Arc<dyn FileMutationObserver>>,
    object_observers: Vec<Arc<dyn ObjectAccessObserver>>,
}

impl StorageHookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_file_observer(&mut self, observer: Arc<dyn FileMutationObserver>) {
        self.file_observers.push(observer);
    }

    pub fn install_object_observer(&mut self, observer: Arc<dyn ObjectAccessObserver>) {
        self.object_observers.push(observer);
    }

    pub fn dispatch_file_mutation(&self, event: &FileMutationEvent) {
        for observer in &self.file_observers {
            observer.on_file_mutation(event);
        }
    }

    pub fn dispatch_object_access(&self, event: &ObjectAccessEvent) {
        for observer in &self.object_observers {
            observer.on_object_access(event);
        }
    }
}

/// Read query against the externally-owned set of monitored databases.
/// Consulted on the file I/O hot path, so implementations must stay cheap.
pub trait MonitoredDatabases: Send + Sync {
    fn is_monitored(&self, database_id: Oid) -> bool;
}

/// Reference implementation backed by a read-mostly lock. Lifecycle
/// management owns the write side.
#[derive(Debug, Default)]
pub struct MonitoredDatabaseSet {
    databases: RwLock<HashSet<Oid>>,
}

impl MonitoredDatabaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, database_id: Oid) {
        self.databases.write().insert(database_id);
    }

    pub fn remove(&self, database_id: Oid) {
        self.databases.write().remove(&database_id);
    }
}

impl MonitoredDatabases for MonitoredDatabaseSet {
    fn is_monitored(&self, database_id: Oid) -> bool {
        self.databases.read().contains(&database_id)
    }
}

/// One-way hand-off of freshly created table ids to an external identity
/// cache. Nothing is ever read back through this seam.
pub trait RelationIdentityCache: Send + Sync {
    fn record_new_table(&self, table_oid: Oid);
}

/// Feeds the active file registry from storage mutation events. Create,
/// extend, and truncate upsert; unlink removes. Events for databases that
/// are not monitored are ignored before the registry is touched.
pub struct ActiveTableDetector {
    registry: Arc<ActiveFileRegistry>,
    membership: Arc<dyn MonitoredDatabases>,
}

impl ActiveTableDetector {
    pub fn new(
        registry: Arc<ActiveFileRegistry>,
        membership: Arc<dyn MonitoredDatabases>,
    ) -> Self {
        Self {
            registry,
            membership,
        }
    }
}

impl FileMutationObserver for ActiveTableDetector {
    fn on_file_mutation(&self, event: &FileMutationEvent) {
        if !self.membership.is_monitored(event.file.database_id) {
            return;
        }
        match event.kind {
            FileMutationKind::Create | FileMutationKind::Extend | FileMutationKind::Truncate => {
                // A refused upsert already warned; the next mutation of the
                // same file re-offers it.
                let _ = self.registry.upsert(event.file);
            }
            FileMutationKind::Unlink => self.registry.remove(&event.file),
        }
    }
}

/// Forwards newly created table ids to the relation identity cache.
/// Pure pass-through; the active file registry is never involved.
pub struct RelationCacheDetector {
    membership: Arc<dyn MonitoredDatabases>,
    cache: Arc<dyn RelationIdentityCache>,
}

impl RelationCacheDetector {
    pub fn new(
        membership: Arc<dyn MonitoredDatabases>,
        cache: Arc<dyn RelationIdentityCache>,
    ) -> Self {
        Self { membership, cache }
    }
}

impl ObjectAccessObserver for RelationCacheDetector {
    fn on_object_access(&self, event: &ObjectAccessEvent) {
        // TODO: decide whether this guard should require both conditions
        // instead of either; keeping the historical OR until then.
        if event.class != ObjectClass::Relation || event.sub_id != 0 {
            return;
        }
        if event.object_id < FIRST_USER_OBJECT_ID {
            return;
        }
        if event.access != ObjectAccessKind::PostCreate {
            return;
        }
        if !self.membership.is_monitored(event.database_id) {
            return;
        }
        self.cache.record_new_table(event.object_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingCache {
        seen: Mutex<Vec<Oid>>,
    }

    impl RelationIdentityCache for RecordingCache {
        fn record_new_table(&self, table_oid: Oid) {
            self.seen.lock().push(table_oid);
        }
    }

    fn create_event(db: Oid, oid: Oid) -> ObjectAccessEvent {
        ObjectAccessEvent {
            access: ObjectAccessKind::PostCreate,
            class: ObjectClass::Relation,
            object_id: oid,
            sub_id: 0,
            database_id: db,
        }
    }

    #[test]
    fn relation_cache_detector_filters_events() {
        let membership = Arc::new(MonitoredDatabaseSet::new());
        membership.add(1);
        let cache = Arc::new(RecordingCache::default());
        let detector = RelationCacheDetector::new(membership, cache.clone());

        detector.on_object_access(&create_event(1, 20001));
        detector.on_object_access(&create_event(1, 100)); // system oid
        detector.on_object_access(&create_event(9, 20002)); // unmonitored db
        detector.on_object_access(&ObjectAccessEvent {
            class: ObjectClass::Other,
            ..create_event(1, 20003)
        });
        detector.on_object_access(&ObjectAccessEvent {
            sub_id: 3,
            ..create_event(1, 20004)
        });
        detector.on_object_access(&ObjectAccessEvent {
            access: ObjectAccessKind::Drop,
            ..create_event(1, 20005)
        });

        assert_eq!(*cache.seen.lock(), vec![20001]);
    }

    #[test]
    fn observers_run_in_install_order() {
        struct Tagger {
            tag: u32,
            trail: Arc<Mutex<Vec<u32>>>,
        }
        impl FileMutationObserver for Tagger {
            fn on_file_mutation(&self, _event: &FileMutationEvent) {
                self.trail.lock().push(self.tag);
            }
        }

        let trail = Arc::new(Mutex::new(Vec::new()));
        let mut chain = StorageHookChain::new();
        chain.install_file_observer(Arc::new(Tagger {
            tag: 1,
            trail: trail.clone(),
        }));
        chain.install_file_observer(Arc::new(Tagger {
            tag: 2,
            trail: trail.clone(),
        }));
        chain.dispatch_file_mutation(&FileMutationEvent {
            kind: FileMutationKind::Extend,
            file: ActiveFileKey {
                database_id: 1,
                tablespace_id: 1663,
                file_id: 16401,
            },
        });
        assert_eq!(*trail.lock(), vec![1, 2]);
    }
}
