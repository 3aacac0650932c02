use crate::fetch::{FetchRequest, StatTuple};
use crate::registry::{NodeId, Oid, SUMMARY_NODE_ID};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// One node's answer to a broadcast. A node that reached its fetch service
/// but failed there reports the failure in `outcome`; the aggregator treats
/// that exactly like an unreachable node and aborts the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReply {
    pub node_id: NodeId,
    pub outcome: Result<Vec<StatTuple>, String>,
}

impl NodeReply {
    pub fn ok(node_id: NodeId, rows: Vec<StatTuple>) -> Self {
        Self {
            node_id,
            outcome: Ok(rows),
        }
    }

    pub fn failed(node_id: NodeId, message: impl Into<String>) -> Self {
        Self {
            node_id,
            outcome: Err(message.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("node {node} unreachable: {message}")]
    NodeUnreachable { node: NodeId, message: String },
    #[error("broadcast failed: {0}")]
    Other(String),
}

/// Synchronous fan-out to every node in the cluster. Timeouts and
/// cancellation live behind this seam; the coordinator only requires that
/// a call either yields a reply per contacted node or fails as a whole.
pub trait ClusterDispatch: Send + Sync {
    fn broadcast(&self, request: &FetchRequest) -> Result<Vec<NodeReply>, BroadcastError>;
}

#[derive(Debug, Error)]
pub enum SizeStoreError {
    #[error("size record store read failed: {0}")]
    Read(String),
}

/// Persisted (table, size, node) rows written by an earlier run, read back
/// once at process startup instead of contacting the cluster.
pub trait SizeRecordStore: Send + Sync {
    fn load_table_sizes(&self) -> Result<Vec<StatTuple>, SizeStoreError>;
}

/// One per-cycle aggregate row. `SUMMARY_NODE_ID` rows hold cluster-wide
/// totals; any other node id is that single node's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTableEntry {
    pub table_oid: Oid,
    pub node_id: NodeId,
    pub size_bytes: i64,
}

/// Per-cycle aggregate keyed by (table, node). Built fresh each cycle and
/// handed to the caller whole; nothing here outlives the cycle.
pub type TableSizeMap = HashMap<(Oid, NodeId), ActiveTableEntry>;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("refresh already in progress for database {0}")]
    RefreshInProgress(Oid),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error("node {node} failed in the {phase} phase: {message}")]
    NodeFailure {
        phase: &'static str,
        node: NodeId,
        message: String,
    },
    #[error("malformed row from node {node}: {reason}")]
    MalformedRow { node: NodeId, reason: String },
    #[error("no node replied to the size phase")]
    NoNodes,
    #[error(transparent)]
    SizeStore(#[from] SizeStoreError),
    #[error("size record store is corrupted ({reason}); recreate the store")]
    CorruptSizeStore { reason: String },
}

/// Decode one wire row. Revision is carried by the column count: two
/// columns mean the node identity is implicit (`SUMMARY_NODE_ID`), three
/// carry it explicitly. Anything else is malformed.
fn decode_tuple(tuple: &StatTuple) -> Result<(Oid, i64, NodeId), String> {
    let columns = tuple.0.as_slice();
    let node_id = match columns.len() {
        2 => i64::from(SUMMARY_NODE_ID),
        3 => columns[2],
        other => return Err(format!("{other} columns, expected 2 or 3")),
    };
    let table_oid =
        Oid::try_from(columns[0]).map_err(|_| format!("table oid {} out of range", columns[0]))?;
    let node_id =
        NodeId::try_from(node_id).map_err(|_| format!("node id {node_id} out of range"))?;
    Ok((table_oid, columns[1], node_id))
}

/// Phase 1 reduction: union the active-table identifiers reported by every
/// node. Fail-fast; a partial union is worthless because a table missing
/// from the candidate set is never sized this cycle.
pub fn union_active_oids(replies: &[NodeReply]) -> Result<HashSet<Oid>, CycleError> {
    let mut oids = HashSet::new();
    for reply in replies {
        let rows = match &reply.outcome {
            Ok(rows) => rows,
            Err(message) => {
                return Err(CycleError::NodeFailure {
                    phase: "active-oid",
                    node: reply.node_id,
                    message: message.clone(),
                })
            }
        };
        for tuple in rows {
            let (table_oid, _, _) = decode_tuple(tuple).map_err(|reason| {
                CycleError::MalformedRow {
                    node: reply.node_id,
                    reason,
                }
            })?;
            oids.insert(table_oid);
        }
    }
    Ok(oids)
}

/// Phase 2 reduction: sum each table's per-node sizes into its sentinel
/// total, retaining individual contributions whenever the reply carried a
/// node column. Revisions may be mixed across nodes; each reply is decoded
/// by its own shape.
pub fn aggregate_sizes(replies: &[NodeReply]) -> Result<TableSizeMap, CycleError> {
    let mut map = TableSizeMap::new();
    for reply in replies {
        let rows = match &reply.outcome {
            Ok(rows) => rows,
            Err(message) => {
                return Err(CycleError::NodeFailure {
                    phase: "size",
                    node: reply.node_id,
                    message: message.clone(),
                })
            }
        };
        for tuple in rows {
            let (table_oid, size_bytes, node_id) = decode_tuple(tuple).map_err(|reason| {
                CycleError::MalformedRow {
                    node: reply.node_id,
                    reason,
                }
            })?;
            if node_id != SUMMARY_NODE_ID {
                map.insert(
                    (table_oid, node_id),
                    ActiveTableEntry {
                        table_oid,
                        node_id,
                        size_bytes,
                    },
                );
            }
            let total = map
                .entry((table_oid, SUMMARY_NODE_ID))
                .or_insert(ActiveTableEntry {
                    table_oid,
                    node_id: SUMMARY_NODE_ID,
                    size_bytes: 0,
                });
            total.size_bytes += size_bytes;
        }
    }
    Ok(map)
}

/// Coordinator side of the two-phase size-fetch protocol.
///
/// Phase 1 asks every node for the tables active anywhere in the cluster;
/// phase 2 asks every node to size exactly that candidate set, and the
/// per-node answers are summed into cluster totals. Either phase failing
/// on any node aborts the cycle: an under-counted total has quota
/// consequences, so partial results are never authoritative.
pub struct SizeFetchCoordinator {
    dispatch: Arc<dyn ClusterDispatch>,
    store: Arc<dyn SizeRecordStore>,
    in_flight: Mutex<HashSet<Oid>>,
}

impl SizeFetchCoordinator {
    pub fn new(dispatch: Arc<dyn ClusterDispatch>, store: Arc<dyn SizeRecordStore>) -> Self {
        Self {
            dispatch,
            store,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run one refresh cycle for a database. With `cold_start` the cluster
    /// is not contacted; the aggregate map is rehydrated from the persisted
    /// size record store instead. Only one cycle may run per database at a
    /// time; overlapping calls fail with `RefreshInProgress`.
    pub fn fetch_active_tables(
        &self,
        database_id: Oid,
        cold_start: bool,
    ) -> Result<TableSizeMap, CycleError> {
        let _guard = self.begin_cycle(database_id)?;
        if cold_start {
            return self.load_from_store();
        }

        let replies = self
            .dispatch
            .broadcast(&FetchRequest::active_oids(database_id))?;
        let candidates = union_active_oids(&replies)?;
        debug!(
            "database {}: {} candidate tables after the active-oid phase",
            database_id,
            candidates.len()
        );

        let request = FetchRequest::table_sizes(database_id, candidates.into_iter().collect());
        let replies = self.dispatch.broadcast(&request)?;
        if replies.is_empty() {
            return Err(CycleError::NoNodes);
        }
        let map = aggregate_sizes(&replies)?;
        info!(
            "database {}: aggregated sizes for {} tables from {} nodes",
            database_id,
            request.table_oids.len(),
            replies.len()
        );
        Ok(map)
    }

    fn load_from_store(&self) -> Result<TableSizeMap, CycleError> {
        let rows = self.store.load_table_sizes()?;
        let mut map = TableSizeMap::new();
        for tuple in &rows {
            let (table_oid, size_bytes, node_id) =
                decode_tuple(tuple).map_err(|reason| CycleError::CorruptSizeStore { reason })?;
            map.insert(
                (table_oid, node_id),
                ActiveTableEntry {
                    table_oid,
                    node_id,
                    size_bytes,
                },
            );
        }
        info!("rehydrated {} size records from the store", map.len());
        Ok(map)
    }

    fn begin_cycle(&self, database_id: Oid) -> Result<CycleGuard<'_>, CycleError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(database_id) {
            return Err(CycleError::RefreshInProgress(database_id));
        }
        Ok(CycleGuard {
            in_flight: &self.in_flight,
            database_id,
        })
    }
}

struct CycleGuard<'a> {
    in_flight: &'a Mutex<HashSet<Oid>>,
    database_id: Oid,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.database_id);
    }
}
