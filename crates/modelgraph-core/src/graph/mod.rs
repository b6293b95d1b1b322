//! # Graph Store Layer
//!
//! Property-graph drivers the engine persists through. A driver opens
//! transactions; a transaction runs parameterized [`Statement`]s and
//! reports mutation [`Counters`]. Read transactions run lookups only and
//! never take the writer's lock.
//!
//! Two drivers are provided:
//! - [`MemoryGraph`]: shared in-memory graph, transactional by copy
//! - [`RedbGraph`](crate::storage::RedbGraph): disk-backed, ACID through redb
//!
//! Both run statements through the same executor, so their semantics are
//! identical by construction.

mod executor;
mod memory;
pub mod statement;

pub use memory::{MemoryGraph, MemoryReadTransaction, MemoryTransaction};
pub use statement::{Link, Properties, RelationshipFilter, Statement, StatementKind};

pub(crate) use executor::{GraphReader, GraphTables, execute, query};

use crate::{ModelError, NodeId, RelationshipId};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

// =============================================================================
// RESULTS
// =============================================================================

/// Mutation counters reported for one or more statements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub nodes_created: usize,
    pub nodes_deleted: usize,
    pub relationships_created: usize,
    pub relationships_deleted: usize,
    pub properties_set: usize,
}

impl AddAssign for Counters {
    fn add_assign(&mut self, other: Self) {
        self.nodes_created += other.nodes_created;
        self.nodes_deleted += other.nodes_deleted;
        self.relationships_created += other.relationships_created;
        self.relationships_deleted += other.relationships_deleted;
        self.properties_set += other.properties_set;
    }
}

/// A node as returned by a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub label: String,
    pub key: String,
    pub properties: Properties,
}

/// An outgoing relationship together with its target node.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedRecord {
    pub rel_type: String,
    pub node: NodeRecord,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Matched nodes (`LoadNode`, `FindNodes`).
    pub records: Vec<NodeRecord>,
    /// Outgoing relationships of the loaded node.
    pub related: Vec<RelatedRecord>,
    pub counters: Counters,
}

impl QueryResult {
    #[must_use]
    pub fn single(&self) -> Option<&NodeRecord> {
        self.records.first()
    }
}

/// Size of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub relationship_count: usize,
}

// =============================================================================
// STORED RECORDS
// =============================================================================

/// Node as kept by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredNode {
    pub label: String,
    pub key: String,
    pub properties: Properties,
}

impl StoredNode {
    pub(crate) fn record(&self, id: NodeId) -> NodeRecord {
        NodeRecord {
            id,
            label: self.label.clone(),
            key: self.key.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// Directed relationship as kept by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredRelationship {
    pub from: NodeId,
    pub to: NodeId,
    pub rel_type: String,
}

// =============================================================================
// DRIVER TRAITS
// =============================================================================

/// One atomic unit of store work.
///
/// Dropping a transaction without `commit` discards its writes.
pub trait GraphTransaction {
    fn run(&mut self, statement: &Statement) -> Result<QueryResult, ModelError>;

    fn commit(self) -> Result<(), ModelError>;

    fn rollback(self) -> Result<(), ModelError>;
}

/// A property-graph backend.
pub trait GraphDriver {
    type Transaction: GraphTransaction;

    /// Transaction that refuses statements which modify the graph.
    type ReadTransaction: GraphTransaction;

    fn begin(&self) -> Result<Self::Transaction, ModelError>;

    /// Open a snapshot for lookups. Committing it is a no-op.
    fn begin_read(&self) -> Result<Self::ReadTransaction, ModelError>;

    fn stats(&self) -> Result<GraphStats, ModelError>;
}

/// Relationship between two nodes, with its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RelationshipEntry {
    pub id: RelationshipId,
    pub relationship: StoredRelationship,
}
