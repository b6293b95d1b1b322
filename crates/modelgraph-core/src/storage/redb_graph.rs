//! # redb-backed Graph Storage
//!
//! A disk-backed property graph using the redb embedded database.
//!
//! Every engine transaction maps to one redb write transaction, providing:
//! - ACID commits (copy-on-write B-trees)
//! - Abort on drop: an uncommitted transaction leaves no trace
//! - Durability across process restarts
//!
//! Lookups that change nothing run in a redb read transaction and do not
//! wait for the writer.
//!
//! Records are postcard-encoded. Label and key are indexed together,
//! which both serves lookups and enforces key uniqueness per class.

use crate::graph::{
    GraphDriver, GraphReader, GraphStats, GraphTables, GraphTransaction, QueryResult, RelationshipEntry,
    Statement, StoredNode, StoredRelationship, execute, query,
};
use crate::{ModelError, NodeId, RelationshipId};
use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Table for nodes: NodeId(u64) -> serialized StoredNode bytes
const NODES: TableDefinition<u64, &[u8]> = TableDefinition::new("nodes");

/// Table for the node index: (label, key) -> NodeId(u64)
const NODE_INDEX: TableDefinition<(&str, &str), u64> = TableDefinition::new("node_index");

/// Table for relationships: RelationshipId(u64) -> serialized StoredRelationship bytes
const RELATIONSHIPS: TableDefinition<u64, &[u8]> = TableDefinition::new("relationships");

/// Table for outgoing adjacency: (from, relationship) -> to
const OUTGOING: TableDefinition<(u64, u64), u64> = TableDefinition::new("outgoing");

/// Table for incoming adjacency: (to, relationship) -> from
const INCOMING: TableDefinition<(u64, u64), u64> = TableDefinition::new("incoming");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_NODE_ID: &str = "next_node_id";
const NEXT_RELATIONSHIP_ID: &str = "next_relationship_id";

/// A disk-backed graph store using redb.
#[derive(Clone)]
pub struct RedbGraph {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbGraph")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbGraph {
    /// Open or create a graph database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| ModelError::Storage(e.to_string()))?;

        // Initialize tables if they don't exist
        {
            let write_txn = db
                .begin_write()
                .map_err(|e| ModelError::Transaction(e.to_string()))?;
            let _ = write_txn
                .open_table(NODES)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(NODE_INDEX)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(RELATIONSHIPS)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(OUTGOING)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(INCOMING)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(METADATA)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            write_txn
                .commit()
                .map_err(|e| ModelError::Transaction(e.to_string()))?;
        }

        tracing::debug!(path = %path.display(), "redb graph opened");
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GraphDriver for RedbGraph {
    type Transaction = RedbTransaction;
    type ReadTransaction = RedbReadTransaction;

    fn begin(&self) -> Result<RedbTransaction, ModelError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| ModelError::Transaction(e.to_string()))?;
        Ok(RedbTransaction { txn })
    }

    fn begin_read(&self) -> Result<RedbReadTransaction, ModelError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| ModelError::Transaction(e.to_string()))?;
        Ok(RedbReadTransaction { txn })
    }

    fn stats(&self) -> Result<GraphStats, ModelError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| ModelError::Transaction(e.to_string()))?;
        let node_count = read_txn
            .open_table(NODES)
            .map_err(|e| ModelError::Storage(e.to_string()))?
            .len()
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        let relationship_count = read_txn
            .open_table(RELATIONSHIPS)
            .map_err(|e| ModelError::Storage(e.to_string()))?
            .len()
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        Ok(GraphStats {
            node_count: node_count as usize,
            relationship_count: relationship_count as usize,
        })
    }
}

/// One redb write transaction.
pub struct RedbTransaction {
    txn: WriteTransaction,
}

impl std::fmt::Debug for RedbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbTransaction").finish_non_exhaustive()
    }
}

impl GraphTransaction for RedbTransaction {
    fn run(&mut self, statement: &Statement) -> Result<QueryResult, ModelError> {
        execute(self, statement)
    }

    fn commit(self) -> Result<(), ModelError> {
        self.txn
            .commit()
            .map_err(|e| ModelError::Transaction(e.to_string()))
    }

    fn rollback(self) -> Result<(), ModelError> {
        self.txn
            .abort()
            .map_err(|e| ModelError::Transaction(e.to_string()))
    }
}

// =============================================================================
// TABLE ACCESS
// =============================================================================

fn storage_error(e: impl std::fmt::Display) -> ModelError {
    ModelError::Storage(e.to_string())
}

fn index_lookup(
    index: &impl ReadableTable<(&'static str, &'static str), u64>,
    label: &str,
    key: &str,
) -> Result<Option<NodeId>, ModelError> {
    Ok(index
        .get((label, key))
        .map_err(storage_error)?
        .map(|v| NodeId(v.value())))
}

fn label_scan(
    index: &impl ReadableTable<(&'static str, &'static str), u64>,
    label: &str,
) -> Result<Vec<NodeId>, ModelError> {
    let mut ids = Vec::new();
    for entry in index.range((label, "")..).map_err(storage_error)? {
        let (key, value) = entry.map_err(storage_error)?;
        if key.value().0 != label {
            break;
        }
        ids.push(NodeId(value.value()));
    }
    Ok(ids)
}

/// Decode a postcard record stored under `id`.
fn record<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> Result<Option<T>, ModelError> {
    match table.get(id).map_err(storage_error)? {
        Some(bytes) => postcard::from_bytes(bytes.value())
            .map(Some)
            .map_err(|e| ModelError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Relationships listed in an adjacency table for one node.
fn adjacent(
    adjacency: &impl ReadableTable<(u64, u64), u64>,
    relationships: &impl ReadableTable<u64, &'static [u8]>,
    id: NodeId,
) -> Result<Vec<RelationshipEntry>, ModelError> {
    let mut entries = Vec::new();
    for entry in adjacency
        .range((id.0, 0)..=(id.0, u64::MAX))
        .map_err(storage_error)?
    {
        let (key, _) = entry.map_err(storage_error)?;
        let rel_id = key.value().1;
        if let Some(relationship) = record(relationships, rel_id)? {
            entries.push(RelationshipEntry {
                id: RelationshipId(rel_id),
                relationship,
            });
        }
    }
    Ok(entries)
}

// =============================================================================
// WRITE TRANSACTION
// =============================================================================

impl RedbTransaction {
    fn next_id(&self, counter: &str) -> Result<u64, ModelError> {
        let mut table = self.txn.open_table(METADATA).map_err(storage_error)?;
        let next = table
            .get(counter)
            .map_err(storage_error)?
            .map(|v| v.value())
            .unwrap_or(0);
        table.insert(counter, next + 1).map_err(storage_error)?;
        Ok(next)
    }

    fn relationship(&self, id: u64) -> Result<Option<StoredRelationship>, ModelError> {
        let table = self.txn.open_table(RELATIONSHIPS).map_err(storage_error)?;
        record(&table, id)
    }

    fn adjacent(
        &self,
        definition: TableDefinition<(u64, u64), u64>,
        id: NodeId,
    ) -> Result<Vec<RelationshipEntry>, ModelError> {
        let adjacency = self.txn.open_table(definition).map_err(storage_error)?;
        let relationships = self.txn.open_table(RELATIONSHIPS).map_err(storage_error)?;
        adjacent(&adjacency, &relationships, id)
    }
}

impl GraphReader for RedbTransaction {
    fn find_node(&self, label: &str, key: &str) -> Result<Option<NodeId>, ModelError> {
        let index = self.txn.open_table(NODE_INDEX).map_err(storage_error)?;
        index_lookup(&index, label, key)
    }

    fn node(&self, id: NodeId) -> Result<Option<StoredNode>, ModelError> {
        let nodes = self.txn.open_table(NODES).map_err(storage_error)?;
        record(&nodes, id.0)
    }

    fn nodes_with_label(&self, label: &str) -> Result<Vec<NodeId>, ModelError> {
        let index = self.txn.open_table(NODE_INDEX).map_err(storage_error)?;
        label_scan(&index, label)
    }

    fn outgoing(&self, id: NodeId) -> Result<Vec<RelationshipEntry>, ModelError> {
        self.adjacent(OUTGOING, id)
    }

    fn incoming(&self, id: NodeId) -> Result<Vec<RelationshipEntry>, ModelError> {
        self.adjacent(INCOMING, id)
    }
}

impl GraphTables for RedbTransaction {
    fn insert_node(&mut self, node: StoredNode) -> Result<NodeId, ModelError> {
        let id = self.next_id(NEXT_NODE_ID)?;
        let bytes = postcard::to_allocvec(&node).map_err(|e| ModelError::Serialization(e.to_string()))?;
        {
            let mut nodes = self
                .txn
                .open_table(NODES)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            nodes
                .insert(id, bytes.as_slice())
                .map_err(|e| ModelError::Storage(e.to_string()))?;
        }
        {
            let mut index = self
                .txn
                .open_table(NODE_INDEX)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            index
                .insert((node.label.as_str(), node.key.as_str()), id)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
        }
        Ok(NodeId(id))
    }

    fn update_node(&mut self, id: NodeId, node: StoredNode) -> Result<(), ModelError> {
        let bytes = postcard::to_allocvec(&node).map_err(|e| ModelError::Serialization(e.to_string()))?;
        let mut nodes = self
            .txn
            .open_table(NODES)
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        nodes
            .insert(id.0, bytes.as_slice())
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        Ok(())
    }

    fn remove_node(&mut self, id: NodeId) -> Result<(), ModelError> {
        let Some(node) = self.node(id)? else {
            return Ok(());
        };
        {
            let mut nodes = self
                .txn
                .open_table(NODES)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            nodes
                .remove(id.0)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
        }
        let mut index = self
            .txn
            .open_table(NODE_INDEX)
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        index
            .remove((node.label.as_str(), node.key.as_str()))
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        Ok(())
    }

    fn insert_relationship(&mut self, relationship: StoredRelationship) -> Result<RelationshipId, ModelError> {
        let id = self.next_id(NEXT_RELATIONSHIP_ID)?;
        let bytes =
            postcard::to_allocvec(&relationship).map_err(|e| ModelError::Serialization(e.to_string()))?;
        {
            let mut relationships = self
                .txn
                .open_table(RELATIONSHIPS)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            relationships
                .insert(id, bytes.as_slice())
                .map_err(|e| ModelError::Storage(e.to_string()))?;
        }
        {
            let mut outgoing = self
                .txn
                .open_table(OUTGOING)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            outgoing
                .insert((relationship.from.0, id), relationship.to.0)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
        }
        let mut incoming = self
            .txn
            .open_table(INCOMING)
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        incoming
            .insert((relationship.to.0, id), relationship.from.0)
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        Ok(RelationshipId(id))
    }

    fn remove_relationship(&mut self, id: RelationshipId) -> Result<(), ModelError> {
        let Some(relationship) = self.relationship(id.0)? else {
            return Ok(());
        };
        {
            let mut relationships = self
                .txn
                .open_table(RELATIONSHIPS)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            relationships
                .remove(id.0)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
        }
        {
            let mut outgoing = self
                .txn
                .open_table(OUTGOING)
                .map_err(|e| ModelError::Storage(e.to_string()))?;
            outgoing
                .remove((relationship.from.0, id.0))
                .map_err(|e| ModelError::Storage(e.to_string()))?;
        }
        let mut incoming = self
            .txn
            .open_table(INCOMING)
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        incoming
            .remove((relationship.to.0, id.0))
            .map_err(|e| ModelError::Storage(e.to_string()))?;
        Ok(())
    }
}

// =============================================================================
// READ TRANSACTION
// =============================================================================

/// One redb read transaction. Mutating statements are refused.
pub struct RedbReadTransaction {
    txn: ReadTransaction,
}

impl std::fmt::Debug for RedbReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbReadTransaction").finish_non_exhaustive()
    }
}

impl GraphTransaction for RedbReadTransaction {
    fn run(&mut self, statement: &Statement) -> Result<QueryResult, ModelError> {
        query(&*self, statement)
    }

    fn commit(self) -> Result<(), ModelError> {
        Ok(())
    }

    fn rollback(self) -> Result<(), ModelError> {
        Ok(())
    }
}

impl RedbReadTransaction {
    fn adjacent(
        &self,
        definition: TableDefinition<(u64, u64), u64>,
        id: NodeId,
    ) -> Result<Vec<RelationshipEntry>, ModelError> {
        let adjacency = self.txn.open_table(definition).map_err(storage_error)?;
        let relationships = self.txn.open_table(RELATIONSHIPS).map_err(storage_error)?;
        adjacent(&adjacency, &relationships, id)
    }
}

impl GraphReader for RedbReadTransaction {
    fn find_node(&self, label: &str, key: &str) -> Result<Option<NodeId>, ModelError> {
        let index = self.txn.open_table(NODE_INDEX).map_err(storage_error)?;
        index_lookup(&index, label, key)
    }

    fn node(&self, id: NodeId) -> Result<Option<StoredNode>, ModelError> {
        let nodes = self.txn.open_table(NODES).map_err(storage_error)?;
        record(&nodes, id.0)
    }

    fn nodes_with_label(&self, label: &str) -> Result<Vec<NodeId>, ModelError> {
        let index = self.txn.open_table(NODE_INDEX).map_err(storage_error)?;
        label_scan(&index, label)
    }

    fn outgoing(&self, id: NodeId) -> Result<Vec<RelationshipEntry>, ModelError> {
        self.adjacent(OUTGOING, id)
    }

    fn incoming(&self, id: NodeId) -> Result<Vec<RelationshipEntry>, ModelError> {
        self.adjacent(INCOMING, id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::Value;
    use crate::graph::{Link, Properties};
    use tempfile::tempdir;

    fn unit_statement(key: &str) -> Statement {
        let mut properties = Properties::new();
        properties.insert("symbol".to_string(), Value::text(key));
        Statement::create_node("Unit", key, &properties, &[]).expect("statement")
    }

    #[test]
    fn basic_operations() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("test.redb")).expect("open db");

        let mut tx = graph.begin().expect("begin");
        tx.run(&unit_statement("kg")).expect("create");
        let resource = Statement::create_node(
            "Resource",
            "Iron",
            &Properties::new(),
            &[Link {
                rel_type: "UNIT_DEFAULT".to_string(),
                target_label: "Unit".to_string(),
                target_key: "kg".to_string(),
                inverse: None,
            }],
        )
        .expect("statement");
        let counters = tx.run(&resource).expect("create").counters;
        assert_eq!(counters.relationships_created, 1);
        tx.commit().expect("commit");

        let stats = graph.stats().expect("stats");
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.relationship_count, 1);
    }

    #[test]
    fn key_uniqueness() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("test.redb")).expect("open db");

        let mut tx = graph.begin().expect("begin");
        tx.run(&unit_statement("kg")).expect("create");
        assert!(matches!(
            tx.run(&unit_statement("kg")),
            Err(ModelError::Transaction(_))
        ));
    }

    #[test]
    fn persistence() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");

        // Create and populate
        {
            let graph = RedbGraph::open(&db_path).expect("open db");
            let mut tx = graph.begin().expect("begin");
            tx.run(&unit_statement("kg")).expect("create");
            tx.run(&unit_statement("t")).expect("create");
            tx.commit().expect("commit");
        }

        // Reopen and verify
        {
            let graph = RedbGraph::open(&db_path).expect("open db");
            assert_eq!(graph.stats().expect("stats").node_count, 2);
            let mut tx = graph.begin().expect("begin");
            let load = Statement::load_node("Unit", "kg", false).expect("statement");
            let result = tx.run(&load).expect("load");
            let node = result.single().expect("node");
            assert_eq!(node.properties.get("symbol"), Some(&Value::text("kg")));
        }
    }

    #[test]
    fn rollback_discards_writes() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("test.redb")).expect("open db");

        let mut tx = graph.begin().expect("begin");
        tx.run(&unit_statement("kg")).expect("create");
        tx.rollback().expect("rollback");
        assert_eq!(graph.stats().expect("stats").node_count, 0);
    }

    #[test]
    fn read_transaction_runs_lookups_only() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("test.redb")).expect("open db");

        let mut tx = graph.begin().expect("begin");
        tx.run(&unit_statement("kg")).expect("create");
        tx.commit().expect("commit");

        let mut read = graph.begin_read().expect("begin read");
        let load = Statement::load_node("Unit", "kg", true).expect("statement");
        let result = read.run(&load).expect("load");
        assert_eq!(
            result.single().map(|n| n.properties.get("symbol")),
            Some(Some(&Value::text("kg")))
        );
        assert!(matches!(
            read.run(&unit_statement("t")),
            Err(ModelError::Transaction(_))
        ));

        // a writer is not blocked by the open reader
        let mut tx = graph.begin().expect("begin");
        tx.run(&unit_statement("t")).expect("create");
        tx.commit().expect("commit");
        read.commit().expect("close");
        assert_eq!(graph.stats().expect("stats").node_count, 2);
    }

    #[test]
    fn detach_delete_clears_adjacency() {
        let temp = tempdir().expect("temp dir");
        let graph = RedbGraph::open(temp.path().join("test.redb")).expect("open db");

        let mut tx = graph.begin().expect("begin");
        tx.run(&unit_statement("kg")).expect("create");
        let resource = Statement::create_node(
            "Resource",
            "Iron",
            &Properties::new(),
            &[Link {
                rel_type: "UNIT_DEFAULT".to_string(),
                target_label: "Unit".to_string(),
                target_key: "kg".to_string(),
                inverse: Some("RESOURCES".to_string()),
            }],
        )
        .expect("statement");
        tx.run(&resource).expect("create");

        let delete = Statement::detach_delete("Unit", "kg").expect("statement");
        let counters = tx.run(&delete).expect("delete").counters;
        assert_eq!(counters.nodes_deleted, 1);
        assert_eq!(counters.relationships_deleted, 2);

        let load = Statement::load_node("Resource", "Iron", true).expect("statement");
        let result = tx.run(&load).expect("load");
        assert!(result.related.is_empty());
        tx.commit().expect("commit");
        assert_eq!(graph.stats().expect("stats").relationship_count, 0);
    }
}
