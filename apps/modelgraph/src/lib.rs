//! # ModelGraph Application Layer
//!
//! Command interpreter, configuration and CLI over `modelgraph-core`.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              apps/modelgraph                  │
//! │                                               │
//! │  ┌─────────┐   ┌──────────────┐   ┌────────┐  │
//! │  │   CLI   │──▶│ Interpreter  │◀──│ config │  │
//! │  │ (clap)  │   │ (scope, cmds)│   │ (toml) │  │
//! │  └─────────┘   └──────┬───────┘   └────────┘  │
//! │                       ▼                       │
//! │               ┌───────────────┐               │
//! │               │modelgraph-core│               │
//! │               │   (ModelDb)   │               │
//! │               └───────────────┘               │
//! └───────────────────────────────────────────────┘
//! ```

pub mod cli;
pub mod config;
pub mod interpreter;

pub use config::{AppConfig, Backend, LogFormat};
pub use interpreter::{Interpreter, Response, ScopeValue, Snapshot};
