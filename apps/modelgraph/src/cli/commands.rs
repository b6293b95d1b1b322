//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::config::{AppConfig, Backend};
use crate::interpreter::{Interpreter, Response};
use modelgraph_core::{GraphDriver, GraphStats, MemoryGraph, ModelDb, ModelError, RedbGraph, SpecRegistry};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a command script (10 MB).
const MAX_SCRIPT_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), ModelError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| ModelError::Io(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(ModelError::Io(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and make sure it names a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, ModelError> {
    let canonical = path
        .canonicalize()
        .map_err(|e| ModelError::Io(format!("Invalid file path '{}': {}", path.display(), e)))?;

    if !canonical.is_file() {
        return Err(ModelError::Io(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

// =============================================================================
// SESSION
// =============================================================================

/// An interpreter over the configured backend.
#[derive(Debug)]
pub enum Session {
    Memory(Interpreter<MemoryGraph>),
    Redb(Interpreter<RedbGraph>),
}

impl Session {
    /// Load the specification and open the store named by `config`.
    pub fn open(config: &AppConfig) -> Result<Self, ModelError> {
        let specs = load_specs(config)?;
        tracing::info!(
            backend = %config.backend,
            classes = specs.class_names().count(),
            "Session opened"
        );
        match config.backend {
            Backend::Memory => Ok(Self::Memory(Interpreter::new(ModelDb::new(
                specs,
                MemoryGraph::new(),
            )))),
            Backend::Redb => {
                let store = RedbGraph::open(&config.database)?;
                Ok(Self::Redb(Interpreter::new(ModelDb::new(specs, store))))
            }
        }
    }

    pub fn process(&mut self, line: &str) -> Response {
        match self {
            Self::Memory(interpreter) => interpreter.process(line),
            Self::Redb(interpreter) => interpreter.process(line),
        }
    }

    pub fn stats(&self) -> Result<GraphStats, ModelError> {
        match self {
            Self::Memory(interpreter) => interpreter.db().driver().stats(),
            Self::Redb(interpreter) => interpreter.db().driver().stats(),
        }
    }
}

fn load_specs(config: &AppConfig) -> Result<SpecRegistry, ModelError> {
    let path = validate_file_path(config.spec_path()?)?;
    SpecRegistry::from_file(&path)
}

fn print_response(response: &Response, json_mode: bool) -> Result<(), ModelError> {
    if json_mode {
        println!("{}", response.to_json()?);
    } else if response.ok {
        println!("{}", response.result);
    } else {
        println!("Error: {}", response.result);
    }
    Ok(())
}

// =============================================================================
// EXEC COMMAND
// =============================================================================

/// Run a single interpreter command.
pub fn cmd_exec(config: &AppConfig, command: &str, json_mode: bool) -> Result<(), ModelError> {
    let mut session = Session::open(config)?;
    let response = session.process(command);
    print_response(&response, json_mode)?;
    if response.ok {
        Ok(())
    } else {
        Err(ModelError::InvalidCommand(format!("Command failed: {}", command.trim())))
    }
}

// =============================================================================
// SCRIPT COMMAND
// =============================================================================

/// Run a command file. Blank lines and lines starting with `#` are skipped.
pub fn cmd_script(config: &AppConfig, file: &Path, json_mode: bool, fail_fast: bool) -> Result<(), ModelError> {
    let path = validate_file_path(file)?;
    validate_file_size(&path, MAX_SCRIPT_FILE_SIZE)?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| ModelError::Io(format!("Cannot read script: {}", e)))?;

    let mut session = Session::open(config)?;
    let mut responses = Vec::new();
    let mut failures = 0usize;

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let response = session.process(line);
        if !json_mode {
            let status = if response.ok { "" } else { "Error: " };
            println!("[{}] {}{}", number + 1, status, response.result);
        }
        let failed = !response.ok;
        responses.push(response);
        if failed {
            failures += 1;
            if fail_fast {
                break;
            }
        }
    }

    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&responses).unwrap_or_default()
        );
    }

    tracing::info!(commands = responses.len(), failures, "Script finished");
    if failures > 0 {
        return Err(ModelError::InvalidCommand(format!(
            "{} of {} commands failed",
            failures,
            responses.len()
        )));
    }
    Ok(())
}

// =============================================================================
// REPL COMMAND
// =============================================================================

/// Interactive session on stdin. `exit` or `quit` ends it.
pub fn cmd_repl(config: &AppConfig, json_mode: bool) -> Result<(), ModelError> {
    let mut session = Session::open(config)?;
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    if !json_mode {
        println!("Type 'help' for a list of commands, 'exit' to leave.");
    }
    loop {
        if !json_mode {
            print!("> ");
            stdout
                .flush()
                .map_err(|e| ModelError::Io(format!("Cannot write prompt: {}", e)))?;
        }
        let mut line = String::new();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .map_err(|e| ModelError::Io(format!("Cannot read input: {}", e)))?;
        if read == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "exit" | "quit" => break,
            command => print_response(&session.process(command), json_mode)?,
        }
    }
    Ok(())
}

// =============================================================================
// VALIDATE COMMAND
// =============================================================================

/// Load the specification and list its classes with their members.
pub fn cmd_validate(config: &AppConfig, json_mode: bool) -> Result<(), ModelError> {
    let specs = load_specs(config)?;

    if json_mode {
        let mut classes = Vec::new();
        for class in specs.classes() {
            classes.push(serde_json::json!({
                "name": class.name,
                "abstract": class.is_abstract,
                "extends": class.extends,
                "members": specs.variable_summary(&class.name)?,
            }));
        }
        let output = serde_json::json!({
            "valid": true,
            "classes": classes,
            "indexes": specs.indexes().len(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Specification OK");
    println!("================");
    for class in specs.classes() {
        let kind = if class.is_abstract { " (abstract)" } else { "" };
        match &class.extends {
            Some(parent) => println!("{}{} extends {}", class.name, kind, parent),
            None => println!("{}{}", class.name, kind),
        }
        for line in specs.variable_summary(&class.name)? {
            println!("  {}", line);
        }
    }
    println!();
    println!("Indexes: {}", specs.indexes().len());
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show store statistics.
pub fn cmd_status(config: &AppConfig, json_mode: bool) -> Result<(), ModelError> {
    let stats = match config.backend {
        Backend::Memory => MemoryGraph::new().stats()?,
        Backend::Redb if config.database.exists() => RedbGraph::open(&config.database)?.stats()?,
        Backend::Redb => GraphStats::default(),
    };

    if json_mode {
        let output = serde_json::json!({
            "database": config.database.to_string_lossy(),
            "backend": config.backend.to_string(),
            "node_count": stats.node_count,
            "relationship_count": stats.relationship_count,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("ModelGraph Store Status");
    println!("=======================");
    if config.backend == Backend::Redb {
        println!("Database:      {:?}", config.database);
    }
    println!("Backend:       {}", config.backend);
    println!();
    println!("Nodes:         {}", stats.node_count);
    println!("Relationships: {}", stats.relationship_count);

    Ok(())
}
