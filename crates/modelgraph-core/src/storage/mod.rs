//! # Persistent Storage
//!
//! Disk-backed graph driver built on redb.

mod redb_graph;

pub use redb_graph::{RedbGraph, RedbReadTransaction, RedbTransaction};
