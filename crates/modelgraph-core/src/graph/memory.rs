//! In-memory property graph.
//!
//! `MemoryGraph` is a cheap handle to one shared graph. Cloning the handle
//! shares the data, which lets tests model a second process reading the
//! same store with an empty register.
//!
//! A transaction works on a private copy taken at `begin`; `commit`
//! publishes the copy. Writers are serialized by the caller, the last
//! commit wins. A read transaction shares the published graph as it was
//! at `begin_read` without copying it.

use super::executor::{GraphReader, GraphTables, execute, query};
use super::{
    GraphDriver, GraphStats, GraphTransaction, QueryResult, RelationshipEntry, Statement, StoredNode,
    StoredRelationship,
};
use crate::{ModelError, NodeId, RelationshipId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct PropertyGraph {
    nodes: BTreeMap<NodeId, StoredNode>,
    /// (label, key) -> node
    node_index: BTreeMap<(String, String), NodeId>,
    relationships: BTreeMap<RelationshipId, StoredRelationship>,
    outgoing: BTreeMap<NodeId, BTreeSet<RelationshipId>>,
    incoming: BTreeMap<NodeId, BTreeSet<RelationshipId>>,
    next_node_id: u64,
    next_relationship_id: u64,
}

impl PropertyGraph {
    fn entries(&self, ids: Option<&BTreeSet<RelationshipId>>) -> Vec<RelationshipEntry> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| {
                self.relationships.get(id).map(|rel| RelationshipEntry {
                    id: *id,
                    relationship: rel.clone(),
                })
            })
            .collect()
    }
}

impl GraphReader for PropertyGraph {
    fn find_node(&self, label: &str, key: &str) -> Result<Option<NodeId>, ModelError> {
        Ok(self
            .node_index
            .get(&(label.to_string(), key.to_string()))
            .copied())
    }

    fn node(&self, id: NodeId) -> Result<Option<StoredNode>, ModelError> {
        Ok(self.nodes.get(&id).cloned())
    }

    fn nodes_with_label(&self, label: &str) -> Result<Vec<NodeId>, ModelError> {
        Ok(self
            .node_index
            .iter()
            .filter(|((l, _), _)| l == label)
            .map(|(_, id)| *id)
            .collect())
    }

    fn outgoing(&self, id: NodeId) -> Result<Vec<RelationshipEntry>, ModelError> {
        Ok(self.entries(self.outgoing.get(&id)))
    }

    fn incoming(&self, id: NodeId) -> Result<Vec<RelationshipEntry>, ModelError> {
        Ok(self.entries(self.incoming.get(&id)))
    }
}

impl GraphTables for PropertyGraph {
    fn insert_node(&mut self, node: StoredNode) -> Result<NodeId, ModelError> {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        self.node_index
            .insert((node.label.clone(), node.key.clone()), id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    fn update_node(&mut self, id: NodeId, node: StoredNode) -> Result<(), ModelError> {
        match self.nodes.get_mut(&id) {
            Some(existing) => {
                existing.properties = node.properties;
                Ok(())
            }
            None => Err(ModelError::Storage(format!("Node {} not found", id.0))),
        }
    }

    fn remove_node(&mut self, id: NodeId) -> Result<(), ModelError> {
        if let Some(node) = self.nodes.remove(&id) {
            self.node_index.remove(&(node.label, node.key));
        }
        self.outgoing.remove(&id);
        self.incoming.remove(&id);
        Ok(())
    }

    fn insert_relationship(&mut self, relationship: StoredRelationship) -> Result<RelationshipId, ModelError> {
        let id = RelationshipId(self.next_relationship_id);
        self.next_relationship_id += 1;
        self.outgoing.entry(relationship.from).or_default().insert(id);
        self.incoming.entry(relationship.to).or_default().insert(id);
        self.relationships.insert(id, relationship);
        Ok(id)
    }

    fn remove_relationship(&mut self, id: RelationshipId) -> Result<(), ModelError> {
        if let Some(rel) = self.relationships.remove(&id) {
            if let Some(out) = self.outgoing.get_mut(&rel.from) {
                out.remove(&id);
            }
            if let Some(inc) = self.incoming.get_mut(&rel.to) {
                inc.remove(&id);
            }
        }
        Ok(())
    }
}

/// Shared in-memory graph store.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    /// Last committed graph. Readers hold on to the `Arc` they found.
    shared: Arc<Mutex<Arc<PropertyGraph>>>,
}

impl MemoryGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn published(&self) -> Result<Arc<PropertyGraph>, ModelError> {
        lock(&self.shared).map(|graph| Arc::clone(&graph))
    }
}

fn lock(shared: &Mutex<Arc<PropertyGraph>>) -> Result<MutexGuard<'_, Arc<PropertyGraph>>, ModelError> {
    shared
        .lock()
        .map_err(|_| ModelError::Transaction("Memory graph lock poisoned".to_string()))
}

impl GraphDriver for MemoryGraph {
    type Transaction = MemoryTransaction;
    type ReadTransaction = MemoryReadTransaction;

    fn begin(&self) -> Result<MemoryTransaction, ModelError> {
        let working = PropertyGraph::clone(&*self.published()?);
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            working,
        })
    }

    fn begin_read(&self) -> Result<MemoryReadTransaction, ModelError> {
        Ok(MemoryReadTransaction {
            snapshot: self.published()?,
        })
    }

    fn stats(&self) -> Result<GraphStats, ModelError> {
        let graph = self.published()?;
        Ok(GraphStats {
            node_count: graph.nodes.len(),
            relationship_count: graph.relationships.len(),
        })
    }
}

/// Transaction over a private copy of a `MemoryGraph`.
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<Mutex<Arc<PropertyGraph>>>,
    working: PropertyGraph,
}

impl GraphTransaction for MemoryTransaction {
    fn run(&mut self, statement: &Statement) -> Result<QueryResult, ModelError> {
        execute(&mut self.working, statement)
    }

    fn commit(self) -> Result<(), ModelError> {
        *lock(&self.shared)? = Arc::new(self.working);
        Ok(())
    }

    fn rollback(self) -> Result<(), ModelError> {
        Ok(())
    }
}

/// Lookups against the graph published when the transaction began.
#[derive(Debug)]
pub struct MemoryReadTransaction {
    snapshot: Arc<PropertyGraph>,
}

impl GraphTransaction for MemoryReadTransaction {
    fn run(&mut self, statement: &Statement) -> Result<QueryResult, ModelError> {
        query(self.snapshot.as_ref(), statement)
    }

    fn commit(self) -> Result<(), ModelError> {
        Ok(())
    }

    fn rollback(self) -> Result<(), ModelError> {
        Ok(())
    }
}
