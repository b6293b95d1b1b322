//! # ModelGraph CLI Module
//!
//! ## Available Commands
//!
//! - `exec` - Run one interpreter command
//! - `script` - Run interpreter commands from a file
//! - `repl` - Interactive interpreter session
//! - `validate` - Check a specification file and list its classes
//! - `status` - Show store statistics

mod commands;

use crate::config::{AppConfig, Backend, LogFormat, Overrides};
use clap::{Parser, Subcommand};
use modelgraph_core::ModelError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// ModelGraph - object model over a property graph
///
/// Classes come from an XML specification. Objects are loaded lazily
/// from the graph store and kept unique per class and key.
#[derive(Parser, Debug)]
#[command(name = "modelgraph")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (defaults to ./modelgraph.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Class specification file (XML)
    #[arg(short = 'S', long, global = true)]
    pub spec: Option<PathBuf>,

    /// Path to the graph database
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Storage backend
    #[arg(short = 'B', long, global = true, value_enum)]
    pub backend: Option<Backend>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one interpreter command, e.g. `exec get Unit name=kg`
    Exec {
        /// Command words, joined with spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run interpreter commands from a file, one per line
    Script {
        /// Path to the command file
        #[arg(short, long)]
        file: PathBuf,

        /// Stop at the first failing command
        #[arg(long)]
        fail_fast: bool,
    },

    /// Start an interactive session
    Repl,

    /// Validate the specification file and list its classes
    Validate,

    /// Show store statistics
    Status,
}

impl Cli {
    /// Configuration file, environment and flags, merged.
    pub fn resolve_config(&self) -> Result<AppConfig, ModelError> {
        let config = AppConfig::discover(self.config.as_deref())?
            .with_env()
            .with_overrides(Overrides {
                spec: self.spec.clone(),
                backend: self.backend,
                database: self.database.clone(),
                log_format: self.log_format,
            });
        Ok(config)
    }
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli, config: &AppConfig) -> Result<(), ModelError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Exec { command }) => cmd_exec(config, &command.join(" "), json_mode),
        Some(Commands::Script { file, fail_fast }) => cmd_script(config, &file, json_mode, fail_fast),
        Some(Commands::Repl) => cmd_repl(config, json_mode),
        Some(Commands::Validate) => cmd_validate(config, json_mode),
        Some(Commands::Status) => cmd_status(config, json_mode),
        None => {
            // No subcommand - show status by default
            cmd_status(config, json_mode)
        }
    }
}
