//! # modelgraph-core
//!
//! Lazy-loading object layer over a property graph.
//!
//! Model classes are declared in an XML specification file and live as
//! objects in one of two modes: *reduced* (only the key is known) or
//! *full* (every attribute and reference populated). Each concrete class
//! maps to a node label, each reference to a relationship type.
//!
//! ## Layers
//!
//! - `spec`: class model registry, XML loader, argument validation
//! - `entity`: the `Entity` contract, `ObjectRef` handles, `DynamicObject`
//! - `class_registry`: class name to constructor lookup
//! - `register`: identity map, at most one live instance per (class, key)
//! - `graph` + `storage`: statement builder, in-memory and redb drivers
//! - `engine`: `ModelDb`, transactional create/read/update/delete
//!
//! ## Architectural Constraints
//!
//! - Pure Rust: no async, no network dependencies
//! - Every read path resolves through the register
//! - In-memory state changes only after the store transaction commits
//! - Statement values are bound as parameters, never spliced into text

// =============================================================================
// MODULES
// =============================================================================

pub mod class_registry;
pub mod engine;
pub mod entity;
pub mod graph;
pub mod register;
pub mod spec;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{ModelError, NodeId, RelationshipId, Value};

// =============================================================================
// RE-EXPORTS: Object Model
// =============================================================================

pub use class_registry::ClassRegistry;
pub use entity::{DynamicObject, Entity, FieldValue, Fields, ModelClass, ObjectRef};
pub use register::{ClassRegister, ObjectRegister};
pub use spec::{
    AttributeSpec, AttributeType, ClassSpec, GENERIC_KEY, IndexSpec, Multiplicity, ReferenceSpec,
    SpecRegistry, relationship_type,
};

// =============================================================================
// RE-EXPORTS: Persistence
// =============================================================================

pub use engine::ModelDb;
pub use graph::{
    Counters, GraphDriver, GraphStats, GraphTransaction, MemoryGraph, MemoryReadTransaction, QueryResult,
    Statement,
};
pub use storage::RedbGraph;
