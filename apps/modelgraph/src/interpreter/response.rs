//! Response types returned for every processed command.

use modelgraph_core::{ModelError, ObjectRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of one command plus the state it left behind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub result: String,
    pub objects: Snapshot,
}

impl Response {
    pub fn to_json(&self) -> Result<String, ModelError> {
        serde_json::to_string_pretty(self).map_err(|e| ModelError::Serialization(e.to_string()))
    }
}

/// Contents of the object register and the interpreter scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Registered objects grouped by class.
    pub model_objects: BTreeMap<String, Vec<ObjectEntry>>,
    pub scope: Vec<ScopeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Object,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub name: String,
    pub kind: ScopeKind,
    pub content: Vec<String>,
}

/// One-line rendering of an object: `@Class.key {member=value, ...}`.
pub fn render(object: &ObjectRef) -> Result<String, ModelError> {
    if object.mini_mode()? {
        return Ok(format!("{object} (reduced)"));
    }
    let members: Vec<String> = object
        .fields()?
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    Ok(format!("{object} {{{}}}", members.join(", ")))
}

/// Rendering for snapshots, which never fail.
pub(crate) fn describe(object: &ObjectRef) -> String {
    render(object).unwrap_or_else(|e| format!("{object} <{e}>"))
}
