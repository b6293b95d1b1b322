//! Statement executor shared by every driver.
//!
//! A driver exposes its storage through [`GraphReader`] and
//! [`GraphTables`]; [`execute`] interprets a [`Statement`] against them
//! and [`query`] runs the non-mutating kinds on read access alone.
//! Pipeline semantics follow the rendered Cypher: a `MATCH` that finds
//! nothing ends the statement and the remaining clauses produce no
//! writes. Callers detect that through the counters.

use super::statement::{Ident, Param, Pattern, Properties, Statement, StatementKind};
use super::{Counters, QueryResult, RelatedRecord, RelationshipEntry, StoredNode, StoredRelationship};
use crate::spec::GENERIC_KEY;
use crate::{ModelError, NodeId, RelationshipId};
use std::collections::BTreeSet;

/// Lookups of a driver, scoped to one transaction.
pub(crate) trait GraphReader {
    fn find_node(&self, label: &str, key: &str) -> Result<Option<NodeId>, ModelError>;

    fn node(&self, id: NodeId) -> Result<Option<StoredNode>, ModelError>;

    fn nodes_with_label(&self, label: &str) -> Result<Vec<NodeId>, ModelError>;

    fn outgoing(&self, id: NodeId) -> Result<Vec<RelationshipEntry>, ModelError>;

    fn incoming(&self, id: NodeId) -> Result<Vec<RelationshipEntry>, ModelError>;
}

/// Primitive writes of a driver, scoped to one transaction.
pub(crate) trait GraphTables: GraphReader {
    fn insert_node(&mut self, node: StoredNode) -> Result<NodeId, ModelError>;

    /// Overwrite the properties of an existing node. Label and key never change.
    fn update_node(&mut self, id: NodeId, node: StoredNode) -> Result<(), ModelError>;

    fn remove_node(&mut self, id: NodeId) -> Result<(), ModelError>;

    fn insert_relationship(&mut self, relationship: StoredRelationship) -> Result<RelationshipId, ModelError>;

    fn remove_relationship(&mut self, id: RelationshipId) -> Result<(), ModelError>;
}

/// Run a `LoadNode` or `FindNodes` statement. Any other kind is refused.
pub(crate) fn query<T: GraphReader>(tables: &T, statement: &Statement) -> Result<QueryResult, ModelError> {
    tracing::debug!(params = statement.params().len(), read_only = true, "{}", statement.to_cypher());
    read(tables, statement)
}

pub(crate) fn execute<T: GraphTables>(tables: &mut T, statement: &Statement) -> Result<QueryResult, ModelError> {
    tracing::debug!(params = statement.params().len(), "{}", statement.to_cypher());

    let mut result = QueryResult::default();
    match statement.kind() {
        StatementKind::CreateNode {
            label,
            key,
            properties,
            links,
        } => {
            let key = statement.text(key)?;
            if tables.find_node(label.as_str(), key)?.is_some() {
                return Err(ModelError::Transaction(format!(
                    "Node ({label} {key}) already exists, violating the unique key constraint"
                )));
            }
            let properties = bind_properties(statement, properties)?;
            result.counters.properties_set = properties.len() + 1;
            let id = tables.insert_node(StoredNode {
                label: label.to_string(),
                key: key.to_string(),
                properties,
            })?;
            result.counters.nodes_created = 1;
            link_nodes(tables, statement, id, links, false, &mut result.counters)?;
        }
        StatementKind::CreateRelationships { label, key, links } => {
            if let Some(id) = anchor(tables, statement, label, key)? {
                link_nodes(tables, statement, id, links, false, &mut result.counters)?;
            }
        }
        StatementKind::MergeRelationships { label, key, links } => {
            if let Some(id) = anchor(tables, statement, label, key)? {
                link_nodes(tables, statement, id, links, true, &mut result.counters)?;
            }
        }
        StatementKind::LoadNode { .. } | StatementKind::FindNodes { .. } => return read(&*tables, statement),
        StatementKind::SetProperties {
            label,
            key,
            properties,
        } => {
            if let Some(id) = anchor(tables, statement, label, key)? {
                let mut node = stored(tables, id)?;
                let updates = bind_properties(statement, properties)?;
                result.counters.properties_set = updates.len();
                node.properties.extend(updates);
                tables.update_node(id, node)?;
            }
        }
        StatementKind::DeleteRelationships {
            label,
            key,
            rel_type,
            inverse,
        } => {
            if let Some(id) = anchor(tables, statement, label, key)? {
                let mut removed = BTreeSet::new();
                for entry in tables.outgoing(id)? {
                    if entry.relationship.rel_type != rel_type.as_str() || removed.contains(&entry.id) {
                        continue;
                    }
                    if let Some(inverse) = inverse {
                        for back in tables.outgoing(entry.relationship.to)? {
                            if back.relationship.rel_type == inverse.as_str()
                                && back.relationship.to == id
                                && back.id != entry.id
                                && removed.insert(back.id)
                            {
                                tables.remove_relationship(back.id)?;
                            }
                        }
                    }
                    removed.insert(entry.id);
                    tables.remove_relationship(entry.id)?;
                }
                result.counters.relationships_deleted = removed.len();
            }
        }
        StatementKind::DetachDelete { label, key } => {
            if let Some(id) = anchor(tables, statement, label, key)? {
                let incident: BTreeSet<RelationshipId> = tables
                    .outgoing(id)?
                    .into_iter()
                    .chain(tables.incoming(id)?)
                    .map(|entry| entry.id)
                    .collect();
                for rel in &incident {
                    tables.remove_relationship(*rel)?;
                }
                tables.remove_node(id)?;
                result.counters.relationships_deleted = incident.len();
                result.counters.nodes_deleted = 1;
            }
        }
    }
    Ok(result)
}

fn read<T: GraphReader>(tables: &T, statement: &Statement) -> Result<QueryResult, ModelError> {
    let mut result = QueryResult::default();
    match statement.kind() {
        StatementKind::LoadNode {
            label,
            key,
            with_relationships,
        } => {
            if let Some(id) = anchor(tables, statement, label, key)? {
                result.records.push(stored(tables, id)?.record(id));
                if *with_relationships {
                    for entry in tables.outgoing(id)? {
                        let target = entry.relationship.to;
                        result.related.push(RelatedRecord {
                            rel_type: entry.relationship.rel_type,
                            node: stored(tables, target)?.record(target),
                        });
                    }
                }
            }
        }
        StatementKind::FindNodes {
            label,
            properties,
            relationships,
        } => {
            let wanted = bind_properties(statement, properties)?;
            'nodes: for id in tables.nodes_with_label(label.as_str())? {
                let node = stored(tables, id)?;
                if !wanted.iter().all(|(name, value)| {
                    if name == GENERIC_KEY {
                        value.as_text() == Some(node.key.as_str())
                    } else {
                        node.properties.get(name) == Some(value)
                    }
                }) {
                    continue;
                }
                let outgoing = tables.outgoing(id)?;
                for filter in relationships {
                    let target_key = statement.text(&filter.target_key)?;
                    let mut matched = false;
                    for entry in outgoing
                        .iter()
                        .filter(|e| e.relationship.rel_type == filter.rel_type.as_str())
                    {
                        let target = stored(tables, entry.relationship.to)?;
                        let label_ok = filter
                            .target_label
                            .as_ref()
                            .is_none_or(|l| l.as_str() == target.label);
                        if target.key == target_key && label_ok {
                            matched = true;
                            break;
                        }
                    }
                    if !matched {
                        continue 'nodes;
                    }
                }
                result.records.push(node.record(id));
            }
        }
        _ => {
            return Err(ModelError::Transaction(format!(
                "Statement '{}' modifies the graph inside a read-only transaction",
                statement.to_cypher()
            )));
        }
    }
    Ok(result)
}

fn anchor<T: GraphReader>(
    tables: &T,
    statement: &Statement,
    label: &Ident,
    key: &Param,
) -> Result<Option<NodeId>, ModelError> {
    tables.find_node(label.as_str(), statement.text(key)?)
}

fn stored<T: GraphReader>(tables: &T, id: NodeId) -> Result<StoredNode, ModelError> {
    tables
        .node(id)?
        .ok_or_else(|| ModelError::Storage(format!("Dangling node reference {}", id.0)))
}

fn bind_properties(statement: &Statement, properties: &[(Ident, Param)]) -> Result<Properties, ModelError> {
    properties
        .iter()
        .map(|(name, param)| Ok((name.to_string(), statement.value(param)?.clone())))
        .collect()
}

fn link_nodes<T: GraphTables>(
    tables: &mut T,
    statement: &Statement,
    anchor: NodeId,
    links: &[Pattern],
    merge: bool,
    counters: &mut Counters,
) -> Result<(), ModelError> {
    for link in links {
        let target_key = statement.text(&link.target_key)?;
        let Some(target) = tables.find_node(link.target_label.as_str(), target_key)? else {
            break;
        };
        counters.relationships_created += connect(tables, anchor, target, &link.rel_type, merge)?;
        if let Some(inverse) = &link.inverse {
            counters.relationships_created += connect(tables, target, anchor, inverse, merge)?;
        }
    }
    Ok(())
}

/// Create one relationship. Returns the number of relationships created.
fn connect<T: GraphTables>(
    tables: &mut T,
    from: NodeId,
    to: NodeId,
    rel_type: &Ident,
    merge: bool,
) -> Result<usize, ModelError> {
    if merge
        && tables
            .outgoing(from)?
            .iter()
            .any(|e| e.relationship.to == to && e.relationship.rel_type == rel_type.as_str())
    {
        return Ok(0);
    }
    tables.insert_relationship(StoredRelationship {
        from,
        to,
        rel_type: rel_type.to_string(),
    })?;
    Ok(1)
}
