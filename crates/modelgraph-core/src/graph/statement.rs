//! Parameterized graph statements.
//!
//! Labels, relationship types and property names are validated
//! identifiers. Every value (keys included) is a bound parameter and never
//! becomes part of the statement text. `to_cypher()` renders the
//! statement with `$name` placeholders for logging.

use crate::spec::validate_identifier;
use crate::{ModelError, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute properties of a node, key excluded.
pub type Properties = BTreeMap<String, Value>;

/// A validated label, relationship type or property name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: &str) -> Result<Self, ModelError> {
        validate_identifier(name)?;
        Ok(Self(name.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a bound parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param(String);

impl Param {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// A relationship to create from the statement's anchor node.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub rel_type: String,
    pub target_label: String,
    pub target_key: String,
    /// Relationship type of the mirrored edge from the target back to the anchor.
    pub inverse: Option<String>,
}

/// "Has a relationship of this type to the node with this key."
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipFilter {
    pub rel_type: String,
    pub target_label: Option<String>,
    pub target_key: String,
}

// =============================================================================
// STATEMENT KINDS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub rel_type: Ident,
    pub target_label: Ident,
    pub target_key: Param,
    pub inverse: Option<Ident>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterPattern {
    pub rel_type: Ident,
    pub target_label: Option<Ident>,
    pub target_key: Param,
}

/// The shape of a statement. Values are referenced through `Param`s.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    /// Create the anchor node, then each relationship to an existing target.
    CreateNode {
        label: Ident,
        key: Param,
        properties: Vec<(Ident, Param)>,
        links: Vec<Pattern>,
    },
    /// Create relationships from an existing anchor node.
    CreateRelationships {
        label: Ident,
        key: Param,
        links: Vec<Pattern>,
    },
    /// As `CreateRelationships`, skipping edges that already exist.
    MergeRelationships {
        label: Ident,
        key: Param,
        links: Vec<Pattern>,
    },
    /// Fetch one node, optionally with its outgoing relationships.
    LoadNode {
        label: Ident,
        key: Param,
        with_relationships: bool,
    },
    /// Nodes of a label matching every property and relationship filter.
    FindNodes {
        label: Ident,
        properties: Vec<(Ident, Param)>,
        relationships: Vec<FilterPattern>,
    },
    SetProperties {
        label: Ident,
        key: Param,
        properties: Vec<(Ident, Param)>,
    },
    /// Delete outgoing relationships of a type, and the mirrored edges back.
    DeleteRelationships {
        label: Ident,
        key: Param,
        rel_type: Ident,
        inverse: Option<Ident>,
    },
    /// Delete a node with every incident relationship.
    DetachDelete { label: Ident, key: Param },
}

/// A statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    kind: StatementKind,
    params: BTreeMap<String, Value>,
}

/// Allocates parameter names and collects their values.
#[derive(Default)]
struct Binder {
    params: BTreeMap<String, Value>,
}

impl Binder {
    fn bind(&mut self, name: String, value: Value) -> Param {
        self.params.insert(name.clone(), value);
        Param(name)
    }

    fn key(&mut self, key: &str) -> Param {
        self.bind("key".to_string(), Value::text(key))
    }

    fn properties(&mut self, properties: &Properties, prefix: &str) -> Result<Vec<(Ident, Param)>, ModelError> {
        properties
            .iter()
            .map(|(name, value)| {
                let ident = Ident::new(name)?;
                let param = self.bind(format!("{prefix}{name}"), value.clone());
                Ok((ident, param))
            })
            .collect()
    }

    fn links(&mut self, links: &[Link]) -> Result<Vec<Pattern>, ModelError> {
        links
            .iter()
            .enumerate()
            .map(|(i, link)| {
                Ok(Pattern {
                    rel_type: Ident::new(&link.rel_type)?,
                    target_label: Ident::new(&link.target_label)?,
                    target_key: self.bind(format!("t{i}"), Value::text(&link.target_key)),
                    inverse: link.inverse.as_deref().map(Ident::new).transpose()?,
                })
            })
            .collect()
    }

    fn finish(self, kind: StatementKind) -> Statement {
        Statement {
            kind,
            params: self.params,
        }
    }
}

impl Statement {
    pub fn create_node(label: &str, key: &str, properties: &Properties, links: &[Link]) -> Result<Self, ModelError> {
        let mut binder = Binder::default();
        let kind = StatementKind::CreateNode {
            label: Ident::new(label)?,
            key: binder.key(key),
            properties: binder.properties(properties, "p_")?,
            links: binder.links(links)?,
        };
        Ok(binder.finish(kind))
    }

    pub fn create_relationships(label: &str, key: &str, links: &[Link]) -> Result<Self, ModelError> {
        let mut binder = Binder::default();
        let kind = StatementKind::CreateRelationships {
            label: Ident::new(label)?,
            key: binder.key(key),
            links: binder.links(links)?,
        };
        Ok(binder.finish(kind))
    }

    pub fn merge_relationships(label: &str, key: &str, links: &[Link]) -> Result<Self, ModelError> {
        let mut binder = Binder::default();
        let kind = StatementKind::MergeRelationships {
            label: Ident::new(label)?,
            key: binder.key(key),
            links: binder.links(links)?,
        };
        Ok(binder.finish(kind))
    }

    pub fn load_node(label: &str, key: &str, with_relationships: bool) -> Result<Self, ModelError> {
        let mut binder = Binder::default();
        let kind = StatementKind::LoadNode {
            label: Ident::new(label)?,
            key: binder.key(key),
            with_relationships,
        };
        Ok(binder.finish(kind))
    }

    pub fn find_nodes(
        label: &str,
        properties: &Properties,
        relationships: &[RelationshipFilter],
    ) -> Result<Self, ModelError> {
        let mut binder = Binder::default();
        let properties = binder.properties(properties, "p_")?;
        let relationships = relationships
            .iter()
            .enumerate()
            .map(|(i, filter)| {
                Ok(FilterPattern {
                    rel_type: Ident::new(&filter.rel_type)?,
                    target_label: filter.target_label.as_deref().map(Ident::new).transpose()?,
                    target_key: binder.bind(format!("t{i}"), Value::text(&filter.target_key)),
                })
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        let kind = StatementKind::FindNodes {
            label: Ident::new(label)?,
            properties,
            relationships,
        };
        Ok(binder.finish(kind))
    }

    pub fn set_properties(label: &str, key: &str, properties: &Properties) -> Result<Self, ModelError> {
        let mut binder = Binder::default();
        let kind = StatementKind::SetProperties {
            label: Ident::new(label)?,
            key: binder.key(key),
            properties: binder.properties(properties, "p_")?,
        };
        Ok(binder.finish(kind))
    }

    pub fn delete_relationships(
        label: &str,
        key: &str,
        rel_type: &str,
        inverse: Option<&str>,
    ) -> Result<Self, ModelError> {
        let mut binder = Binder::default();
        let kind = StatementKind::DeleteRelationships {
            label: Ident::new(label)?,
            key: binder.key(key),
            rel_type: Ident::new(rel_type)?,
            inverse: inverse.map(Ident::new).transpose()?,
        };
        Ok(binder.finish(kind))
    }

    pub fn detach_delete(label: &str, key: &str) -> Result<Self, ModelError> {
        let mut binder = Binder::default();
        let kind = StatementKind::DetachDelete {
            label: Ident::new(label)?,
            key: binder.key(key),
        };
        Ok(binder.finish(kind))
    }

    #[must_use]
    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    /// Value bound to `param`.
    pub fn value(&self, param: &Param) -> Result<&Value, ModelError> {
        self.params
            .get(param.name())
            .ok_or_else(|| ModelError::MissingParameter(param.name().to_string()))
    }

    /// Text value bound to `param`.
    pub fn text(&self, param: &Param) -> Result<&str, ModelError> {
        self.value(param)?
            .as_text()
            .ok_or_else(|| ModelError::MissingParameter(param.name().to_string()))
    }

    /// Render as Cypher text with `$param` placeholders.
    #[must_use]
    pub fn to_cypher(&self) -> String {
        match &self.kind {
            StatementKind::CreateNode {
                label,
                key,
                properties,
                links,
            } => {
                let mut text = format!("CREATE (n:{label} {{key: {key}");
                for (name, param) in properties {
                    text.push_str(&format!(", {name}: {param}"));
                }
                text.push_str("})");
                render_links(&mut text, links, "CREATE");
                text
            }
            StatementKind::CreateRelationships { label, key, links } => {
                let mut text = format!("MATCH (n:{label} {{key: {key}}})");
                render_links(&mut text, links, "CREATE");
                text
            }
            StatementKind::MergeRelationships { label, key, links } => {
                let mut text = format!("MATCH (n:{label} {{key: {key}}})");
                render_links(&mut text, links, "MERGE");
                text
            }
            StatementKind::LoadNode {
                label,
                key,
                with_relationships,
            } => {
                if *with_relationships {
                    format!(
                        "MATCH (n:{label} {{key: {key}}}) OPTIONAL MATCH (n)-[r]->(m) RETURN n, type(r), m"
                    )
                } else {
                    format!("MATCH (n:{label} {{key: {key}}}) RETURN n")
                }
            }
            StatementKind::FindNodes {
                label,
                properties,
                relationships,
            } => {
                let mut text = format!("MATCH (n:{label}");
                if !properties.is_empty() {
                    let pairs: Vec<String> = properties
                        .iter()
                        .map(|(name, param)| format!("{name}: {param}"))
                        .collect();
                    text.push_str(&format!(" {{{}}}", pairs.join(", ")));
                }
                text.push(')');
                for (i, filter) in relationships.iter().enumerate() {
                    let target = match &filter.target_label {
                        Some(l) => format!("f{i}:{l}"),
                        None => format!("f{i}"),
                    };
                    text.push_str(&format!(
                        " MATCH (n)-[:{}]->({} {{key: {}}})",
                        filter.rel_type, target, filter.target_key
                    ));
                }
                text.push_str(" RETURN DISTINCT n");
                text
            }
            StatementKind::SetProperties {
                label,
                key,
                properties,
            } => {
                let assignments: Vec<String> = properties
                    .iter()
                    .map(|(name, param)| format!("n.{name} = {param}"))
                    .collect();
                format!(
                    "MATCH (n:{label} {{key: {key}}}) SET {}",
                    assignments.join(", ")
                )
            }
            StatementKind::DeleteRelationships {
                label,
                key,
                rel_type,
                inverse,
            } => {
                let mut text = format!("MATCH (n:{label} {{key: {key}}})-[r:{rel_type}]->(m)");
                if let Some(inverse) = inverse {
                    text.push_str(&format!(" OPTIONAL MATCH (m)-[i:{inverse}]->(n) DELETE i"));
                }
                text.push_str(" DELETE r");
                text
            }
            StatementKind::DetachDelete { label, key } => {
                format!("MATCH (n:{label} {{key: {key}}}) DETACH DELETE n")
            }
        }
    }
}

fn render_links(text: &mut String, links: &[Pattern], verb: &str) {
    for (i, link) in links.iter().enumerate() {
        text.push_str(&format!(
            " WITH n MATCH (t{i}:{} {{key: {}}}) {verb} (n)-[:{}]->(t{i})",
            link.target_label, link.target_key, link.rel_type
        ));
        if let Some(inverse) = &link.inverse {
            text.push_str(&format!(" {verb} (t{i})-[:{inverse}]->(n)"));
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cypher())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(rel: &str, label: &str, key: &str, inverse: Option<&str>) -> Link {
        Link {
            rel_type: rel.to_string(),
            target_label: label.to_string(),
            target_key: key.to_string(),
            inverse: inverse.map(str::to_string),
        }
    }

    #[test]
    fn create_node_binds_every_value() {
        let mut properties = Properties::new();
        properties.insert("density".to_string(), Value::Float(7.8));
        let statement = Statement::create_node(
            "Resource",
            "Iron'}) DETACH DELETE (x",
            &properties,
            &[link("UNIT_DEFAULT", "Unit", "kg", Some("RESOURCES"))],
        )
        .expect("statement");

        assert_eq!(
            statement.to_cypher(),
            "CREATE (n:Resource {key: $key, density: $p_density}) \
             WITH n MATCH (t0:Unit {key: $t0}) CREATE (n)-[:UNIT_DEFAULT]->(t0) \
             CREATE (t0)-[:RESOURCES]->(n)"
        );
        assert_eq!(
            statement.params().get("key"),
            Some(&Value::text("Iron'}) DETACH DELETE (x"))
        );
        assert_eq!(statement.params().get("t0"), Some(&Value::text("kg")));
        assert!(!statement.to_cypher().contains("Iron"));
    }

    #[test]
    fn property_names_never_shadow_link_keys() {
        let mut properties = Properties::new();
        properties.insert("t0".to_string(), Value::text("calibrated"));
        properties.insert("key".to_string(), Value::text("shadow"));
        let statement = Statement::create_node(
            "Sensor",
            "S1",
            &properties,
            &[link("UNIT", "Unit", "kg", None)],
        )
        .expect("statement");

        let StatementKind::CreateNode {
            key,
            properties,
            links,
            ..
        } = statement.kind()
        else {
            unreachable!("create node statement");
        };
        assert_eq!(statement.text(key).expect("key"), "S1");
        assert_eq!(statement.text(&links[0].target_key).expect("target"), "kg");
        let bound: Vec<(&str, &Value)> = properties
            .iter()
            .map(|(name, param)| (name.as_str(), statement.value(param).expect("bound")))
            .collect();
        assert_eq!(
            bound,
            vec![
                ("key", &Value::text("shadow")),
                ("t0", &Value::text("calibrated")),
            ]
        );
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(matches!(
            Statement::load_node("Unit) DETACH DELETE (n", "kg", false),
            Err(ModelError::InvalidIdentifier(_))
        ));
        let mut properties = Properties::new();
        properties.insert("a b".to_string(), Value::Int(1));
        assert!(Statement::set_properties("Unit", "kg", &properties).is_err());
        assert!(Statement::delete_relationships("Unit", "kg", "R-1", None).is_err());
    }

    #[test]
    fn find_nodes_rendering() {
        let mut properties = Properties::new();
        properties.insert("density".to_string(), Value::Float(1.0));
        let statement = Statement::find_nodes(
            "Resource",
            &properties,
            &[RelationshipFilter {
                rel_type: "UNIT_DEFAULT".to_string(),
                target_label: None,
                target_key: "kg".to_string(),
            }],
        )
        .expect("statement");
        assert_eq!(
            statement.to_cypher(),
            "MATCH (n:Resource {density: $p_density}) \
             MATCH (n)-[:UNIT_DEFAULT]->(f0 {key: $t0}) RETURN DISTINCT n"
        );
    }

    #[test]
    fn parameter_lookup() {
        let statement = Statement::detach_delete("Unit", "kg").expect("statement");
        assert_eq!(
            statement.to_cypher(),
            "MATCH (n:Unit {key: $key}) DETACH DELETE n"
        );
        let StatementKind::DetachDelete { key, .. } = statement.kind() else {
            unreachable!("detach delete statement");
        };
        assert_eq!(statement.text(key).expect("bound"), "kg");
        assert!(matches!(
            statement.value(&Param("missing".to_string())),
            Err(ModelError::MissingParameter(_))
        ));
    }
}
