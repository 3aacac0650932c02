//! Active-table detection and distributed size aggregation for a sharded
//! database cluster.
//!
//! Mutation detectors feed a bounded per-node registry of recently changed
//! storage files; once per monitoring cycle the coordinator harvests that
//! registry on every node, resolves files to their primary tables, and runs
//! a two-phase broadcast that sums per-node table sizes into cluster-wide
//! totals. Quota evaluation, persistence of the resulting sizes, and the
//! transport between nodes are external collaborators behind traits.

pub mod fetch;
pub mod harvest;
pub mod hooks;
pub mod protocol;
pub mod registry;

pub use fetch::{
    FetchError, FetchMode, FetchRequest, NodeFetchService, ProtocolRevision, SizeProbeError,
    StatTuple, TableSizer, FETCH_ACTIVE_OIDS, FETCH_TABLE_SIZES,
};
pub use harvest::{FileResolver, LocalHarvester};
pub use hooks::{
    ActiveTableDetector, FileMutationEvent, FileMutationKind, FileMutationObserver,
    MonitoredDatabaseSet, MonitoredDatabases, ObjectAccessEvent, ObjectAccessKind,
    ObjectAccessObserver, ObjectClass, RelationCacheDetector, RelationIdentityCache,
    StorageHookChain,
};
pub use protocol::{
    aggregate_sizes, union_active_oids, ActiveTableEntry, BroadcastError, ClusterDispatch,
    CycleError, NodeReply, SizeFetchCoordinator, SizeRecordStore, SizeStoreError, TableSizeMap,
};
pub use registry::{
    ActiveFileKey, ActiveFileRegistry, ActiveFileRegistryConfig, NodeId, Oid,
    FIRST_USER_OBJECT_ID, SUMMARY_NODE_ID,
};
