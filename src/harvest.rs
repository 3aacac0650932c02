use crate::registry::{ActiveFileRegistry, Oid};
use log::debug;
use std::collections::HashSet;
use std::sync::Arc;

/// Maps physical files back to logical tables using the node's current
/// catalog state. `resolve_table` answers "which table owns this file right
/// now", and `primary_table` collapses a child partition, index, or fork
/// owner to the user-visible root table that quota accounting charges.
pub trait FileResolver: Send + Sync {
    fn resolve_table(&self, tablespace_id: Oid, file_id: Oid) -> Option<Oid>;
    fn primary_table(&self, table_oid: Oid) -> Oid;
}

/// Per-cycle drain-and-resolve step, run on whichever process is refreshing
/// a given database.
pub struct LocalHarvester {
    registry: Arc<ActiveFileRegistry>,
    resolver: Arc<dyn FileResolver>,
}

impl LocalHarvester {
    pub fn new(registry: Arc<ActiveFileRegistry>, resolver: Arc<dyn FileResolver>) -> Self {
        Self { registry, resolver }
    }

    /// Drain the registry for one database and resolve the drained files to
    /// unique primary table oids. Files that cannot be resolved this round
    /// (dropped and re-created underneath us, typically) go back into the
    /// registry so the next cycle retries them; they are never lost.
    pub fn harvest(&self, database_id: Oid) -> HashSet<Oid> {
        let drained = self.registry.drain_for_database(database_id);
        let mut tables = HashSet::new();
        let mut unresolved = 0usize;
        for key in drained {
            match self
                .resolver
                .resolve_table(key.tablespace_id, key.file_id)
            {
                Some(table_oid) => {
                    tables.insert(self.resolver.primary_table(table_oid));
                }
                None => {
                    unresolved += 1;
                    self.registry.restore(key);
                }
            }
        }
        if unresolved > 0 {
            debug!(
                "requeued {} unresolved files for database {}",
                unresolved, database_id
            );
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ActiveFileKey, ActiveFileRegistryConfig};
    use std::collections::HashMap;

    struct MapResolver {
        files: HashMap<Oid, Oid>,
        parents: HashMap<Oid, Oid>,
    }

    impl FileResolver for MapResolver {
        fn resolve_table(&self, _tablespace_id: Oid, file_id: Oid) -> Option<Oid> {
            self.files.get(&file_id).copied()
        }

        fn primary_table(&self, table_oid: Oid) -> Oid {
            self.parents.get(&table_oid).copied().unwrap_or(table_oid)
        }
    }

    fn key(file: Oid) -> ActiveFileKey {
        ActiveFileKey {
            database_id: 1,
            tablespace_id: 1663,
            file_id: file,
        }
    }

    #[test]
    fn forks_and_children_collapse_to_one_primary() {
        let registry = Arc::new(ActiveFileRegistry::new(ActiveFileRegistryConfig::default()));
        registry.upsert(key(100)); // table 20000
        registry.upsert(key(101)); // index of 20000
        registry.upsert(key(102)); // child partition of 20000
        let resolver = Arc::new(MapResolver {
            files: HashMap::from([(100, 20000), (101, 20010), (102, 20020)]),
            parents: HashMap::from([(20010, 20000), (20020, 20000)]),
        });
        let harvester = LocalHarvester::new(registry.clone(), resolver);
        let tables = harvester.harvest(1);
        assert_eq!(tables, HashSet::from([20000]));
        assert!(registry.is_empty());
    }

    #[test]
    fn unresolved_files_come_back_next_cycle() {
        let registry = Arc::new(ActiveFileRegistry::new(ActiveFileRegistryConfig::default()));
        registry.upsert(key(100));
        registry.upsert(key(999)); // not in the catalog yet
        let resolver = Arc::new(MapResolver {
            files: HashMap::from([(100, 20000)]),
            parents: HashMap::new(),
        });
        let harvester = LocalHarvester::new(registry.clone(), resolver);

        assert_eq!(harvester.harvest(1), HashSet::from([20000]));
        assert_eq!(registry.len(), 1);

        // Still unresolvable: drained again, requeued again.
        assert!(harvester.harvest(1).is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.drain_for_database(1), vec![key(999)]);
    }
}
