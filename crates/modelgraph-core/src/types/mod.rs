//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the engine:
//! - Graph identifiers (`NodeId`, `RelationshipId`)
//! - Attribute values (`Value`)
//! - Error types (`ModelError`)
//!
//! Property maps use `BTreeMap` so that stored records and rendered
//! statements have a stable ordering.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// GRAPH IDENTIFIERS
// =============================================================================

/// Internal identifier of a node in a graph store.
///
/// Node ids are store-local. The engine never exposes them to callers:
/// objects are addressed by `(class, key)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Internal identifier of a relationship in a graph store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipId(pub u64);

// =============================================================================
// VALUE
// =============================================================================

/// A single attribute value.
///
/// The variants mirror the semantic attribute types a class specification
/// can declare (`text`, `int`, `float`, `boolean`, `datetime`, `pos_geo`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// UTF-8 text. Keys are always text.
    Text(String),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean flag.
    Boolean(bool),
    /// Timestamp without time zone.
    DateTime(NaiveDateTime),
    /// Geographic position as (latitude, longitude).
    Geo(f64, f64),
}

impl Value {
    /// Create a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Get the value as a string slice if it is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the variant, used in type mismatch messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::DateTime(_) => "datetime",
            Self::Geo(_, _) => "pos_geo",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
            Self::Geo(lat, lon) => write!(f, "({lat}, {lon})"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Self::DateTime(dt)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the modelgraph engine.
///
/// - Validation errors are raised before any store mutation is attempted
/// - Persistence errors abort the surrounding transaction
/// - Not-found on reads is `Ok(None)`, never an error
#[derive(Debug, Error)]
pub enum ModelError {
    /// The class specification source is malformed or violates a structural rule.
    #[error("Specification error: {0}")]
    Specification(String),

    /// The class name is not part of the active specification.
    #[error("Class {0} not recognized")]
    UnknownClass(String),

    /// The class is abstract and has no identity, constructor or register.
    #[error("Class {0} is abstract")]
    AbstractClass(String),

    /// A member name is neither an attribute nor a reference of the class.
    #[error("Invalid member '{member}' for class {class}")]
    UnknownMember { class: String, member: String },

    /// A required attribute or reference is absent.
    #[error("{field} is required for class {class}")]
    MissingField { class: String, field: String },

    /// A provided value does not match the declared semantic type.
    #[error("{class}.{field} expects {expected}, got {found}")]
    TypeMismatch {
        class: String,
        field: String,
        expected: String,
        found: String,
    },

    /// No key value was supplied.
    #[error("Key attribute {key_name} not provided for class {class}")]
    MissingKey { class: String, key_name: String },

    /// An update tried to reassign the key.
    #[error("Updating the key of a {0} object is not allowed")]
    KeyMutation(String),

    /// The addressed object does not exist.
    #[error("No object of type {class} with key {key} found")]
    NotFound { class: String, key: String },

    /// An object with this key exists already.
    #[error("An object of type {class} with key {key} already exists")]
    AlreadyExists { class: String, key: String },

    /// An object with this key exists with different field values.
    #[error("Object {class} {key} exists with different field values")]
    Conflict { class: String, key: String },

    /// A referenced object is not present in the store.
    #[error("Referenced object {class} {key} does not exist")]
    MissingReference { class: String, key: String },

    /// Mutation counters reported by the store differ from the expected ones.
    #[error(
        "Expected {expected_nodes} node(s) and {expected_relationships} relationship(s) \
         but got {nodes} node(s) and {relationships} relationship(s)"
    )]
    CountMismatch {
        expected_nodes: usize,
        expected_relationships: usize,
        nodes: usize,
        relationships: usize,
    },

    /// A label, relationship type or property name is not a valid identifier.
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A statement refers to a parameter it does not bind.
    #[error("Unbound statement parameter: ${0}")]
    MissingParameter(String),

    /// The graph store rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A transaction could not be started, committed or rolled back.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// An object was accessed while already mutably borrowed.
    #[error("Object {0} is busy")]
    Borrow(String),

    /// A façade command could not be parsed or executed.
    #[error("{0}")]
    InvalidCommand(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

// =============================================================================
// TESTS
// =============================================================================
