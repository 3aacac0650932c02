use crate::harvest::LocalHarvester;
use crate::registry::{NodeId, Oid, SUMMARY_NODE_ID};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const FETCH_ACTIVE_OIDS: i32 = 0;
pub const FETCH_TABLE_SIZES: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Report the identifiers of locally active tables; sizes are not
    /// computed yet.
    ActiveOids,
    /// Compute the local byte size of exactly the requested tables.
    TableSizes,
}

impl TryFrom<i32> for FetchMode {
    type Error = FetchError;

    fn try_from(mode: i32) -> Result<Self, FetchError> {
        match mode {
            FETCH_ACTIVE_OIDS => Ok(FetchMode::ActiveOids),
            FETCH_TABLE_SIZES => Ok(FetchMode::TableSizes),
            other => Err(FetchError::UnknownMode(other)),
        }
    }
}

/// Request broadcast to every node in both protocol phases. The mode is
/// carried raw so a node can reject revisions it does not understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub mode: i32,
    pub database_id: Oid,
    pub table_oids: Vec<Oid>,
}

impl FetchRequest {
    pub fn active_oids(database_id: Oid) -> Self {
        Self {
            mode: FETCH_ACTIVE_OIDS,
            database_id,
            table_oids: Vec::new(),
        }
    }

    pub fn table_sizes(database_id: Oid, mut table_oids: Vec<Oid>) -> Self {
        table_oids.sort_unstable();
        Self {
            mode: FETCH_TABLE_SIZES,
            database_id,
            table_oids,
        }
    }
}

/// One result row on the wire: `[oid, size]` under revision 1,
/// `[oid, size, node]` under revision 2. The aggregator tells the two
/// apart by column count alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatTuple(pub Vec<i64>);

impl StatTuple {
    pub fn v1(table_oid: Oid, size_bytes: i64) -> Self {
        StatTuple(vec![i64::from(table_oid), size_bytes])
    }

    pub fn v2(table_oid: Oid, size_bytes: i64, node_id: NodeId) -> Self {
        StatTuple(vec![i64::from(table_oid), size_bytes, i64::from(node_id)])
    }
}

/// Wire revision spoken by a node. Revision 1 predates the per-node
/// identity column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolRevision {
    V1,
    #[default]
    V2,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unknown fetch mode {0}, request rejected")]
    UnknownMode(i32),
}

/// Failure of one local size computation. Returning an error is the
/// sizer's isolation boundary: by the time the error is visible, any
/// locks or resources taken for the attempt must already be released.
#[derive(Debug, Error)]
#[error("size probe failed: {0}")]
pub struct SizeProbeError(pub String);

/// Computes one table's on-disk byte size on the local node.
pub trait TableSizer: Send + Sync {
    fn table_size(&self, table_oid: Oid) -> Result<i64, SizeProbeError>;
}

/// Node-side half of the fetch protocol: answers both broadcast phases for
/// this node's partition of the data.
pub struct NodeFetchService {
    node_id: NodeId,
    revision: ProtocolRevision,
    harvester: LocalHarvester,
    sizer: Arc<dyn TableSizer>,
}

impl NodeFetchService {
    pub fn new(
        node_id: NodeId,
        revision: ProtocolRevision,
        harvester: LocalHarvester,
        sizer: Arc<dyn TableSizer>,
    ) -> Self {
        Self {
            node_id,
            revision,
            harvester,
            sizer,
        }
    }

    pub fn handle(&self, request: &FetchRequest) -> Result<Vec<StatTuple>, FetchError> {
        match FetchMode::try_from(request.mode)? {
            FetchMode::ActiveOids => Ok(self.active_oids(request.database_id)),
            FetchMode::TableSizes => Ok(self.table_sizes(&request.table_oids)),
        }
    }

    /// Phase 1: drain and resolve the local registry. Sizes are reported
    /// as zero and the node column, when present, is the sentinel; only
    /// the identifiers matter in this phase.
    fn active_oids(&self, database_id: Oid) -> Vec<StatTuple> {
        let mut oids: Vec<Oid> = self.harvester.harvest(database_id).into_iter().collect();
        oids.sort_unstable();
        oids.into_iter()
            .map(|oid| match self.revision {
                ProtocolRevision::V1 => StatTuple::v1(oid, 0),
                ProtocolRevision::V2 => StatTuple::v2(oid, 0, SUMMARY_NODE_ID),
            })
            .collect()
    }

    /// Phase 2: size every requested table. Each probe runs in its own
    /// bulkhead: a failure is logged, recorded as zero, and the loop moves
    /// on. One dropped table must not starve the rest of the batch.
    fn table_sizes(&self, table_oids: &[Oid]) -> Vec<StatTuple> {
        table_oids
            .iter()
            .map(|&oid| {
                let size = match self.sizer.table_size(oid) {
                    Ok(size) => size,
                    Err(err) => {
                        warn!("node {}: sizing table {} failed: {}", self.node_id, oid, err);
                        0
                    }
                };
                match self.revision {
                    ProtocolRevision::V1 => StatTuple::v1(oid, size),
                    ProtocolRevision::V2 => StatTuple::v2(oid, size, self.node_id),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::FileResolver;
    use crate::registry::{ActiveFileRegistry, ActiveFileRegistryConfig};
    use std::collections::HashMap;

    struct EmptyResolver;

    impl FileResolver for EmptyResolver {
        fn resolve_table(&self, _tablespace_id: Oid, _file_id: Oid) -> Option<Oid> {
            None
        }

        fn primary_table(&self, table_oid: Oid) -> Oid {
            table_oid
        }
    }

    struct FixedSizer {
        sizes: HashMap<Oid, i64>,
    }

    impl TableSizer for FixedSizer {
        fn table_size(&self, table_oid: Oid) -> Result<i64, SizeProbeError> {
            self.sizes
                .get(&table_oid)
                .copied()
                .ok_or_else(|| SizeProbeError(format!("table {table_oid} dropped")))
        }
    }

    fn service(revision: ProtocolRevision, sizes: HashMap<Oid, i64>) -> NodeFetchService {
        let registry = Arc::new(ActiveFileRegistry::new(ActiveFileRegistryConfig::default()));
        NodeFetchService::new(
            7,
            revision,
            LocalHarvester::new(registry, Arc::new(EmptyResolver)),
            Arc::new(FixedSizer { sizes }),
        )
    }

    #[test]
    fn unknown_mode_is_rejected_before_any_work() {
        let service = service(ProtocolRevision::V2, HashMap::new());
        let request = FetchRequest {
            mode: 42,
            database_id: 1,
            table_oids: vec![20000],
        };
        assert!(matches!(
            service.handle(&request),
            Err(FetchError::UnknownMode(42))
        ));
    }

    #[test]
    fn failed_probe_degrades_to_zero_and_continues() {
        let service = service(
            ProtocolRevision::V2,
            HashMap::from([(20000, 100), (20002, 50)]),
        );
        let rows = service
            .handle(&FetchRequest::table_sizes(1, vec![20000, 20001, 20002]))
            .unwrap();
        assert_eq!(
            rows,
            vec![
                StatTuple::v2(20000, 100, 7),
                StatTuple::v2(20001, 0, 7),
                StatTuple::v2(20002, 50, 7),
            ]
        );
    }

    #[test]
    fn revision_one_rows_omit_the_node_column() {
        let service = service(ProtocolRevision::V1, HashMap::from([(20000, 100)]));
        let rows = service
            .handle(&FetchRequest::table_sizes(1, vec![20000]))
            .unwrap();
        assert_eq!(rows, vec![StatTuple::v1(20000, 100)]);
    }
}
