//! # Application Configuration
//!
//! Settings come from an optional TOML file, then the
//! `MODELGRAPH_LOG_FORMAT` environment variable (log format only), then
//! CLI flags. Later sources win.
//!
//! ```toml
//! spec = "specs/resource_transmission.xml"
//! backend = "redb"
//! database = "modelgraph.redb"
//! log_format = "text"
//! ```

use clap::ValueEnum;
use modelgraph_core::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Configuration file looked up in the working directory when no
/// `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "modelgraph.toml";

/// Environment variable selecting the log format.
pub const LOG_FORMAT_ENV: &str = "MODELGRAPH_LOG_FORMAT";

/// Graph store driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-local graph, discarded on exit
    #[default]
    Memory,
    /// redb database file
    Redb,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redb => write!(f, "redb"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Resolved application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Class specification file (XML).
    pub spec: Option<PathBuf>,
    pub backend: Backend,
    /// Database file for the redb backend.
    pub database: PathBuf,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            spec: None,
            backend: Backend::default(),
            database: PathBuf::from("modelgraph.redb"),
            log_format: LogFormat::default(),
        }
    }
}

/// Values given on the command line. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub spec: Option<PathBuf>,
    pub backend: Option<Backend>,
    pub database: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ModelError> {
        toml::from_str(content)
            .map_err(|e| ModelError::Serialization(format!("Invalid configuration: {}", e)))
    }

    /// Load a configuration file. Relative `spec` and `database` paths are
    /// resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModelError::Io(format!("Cannot read configuration '{}': {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(base) = path.parent() {
            config.spec = config.spec.map(|spec| base.join(spec));
            config.database = base.join(&config.database);
        }
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// An explicit path must exist. Without one, `modelgraph.toml` in the
    /// working directory is used when present, defaults otherwise.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ModelError> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(spec) = overrides.spec {
            self.spec = Some(spec);
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(database) = overrides.database {
            self.database = database;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        self
    }

    /// Apply `MODELGRAPH_LOG_FORMAT` when it names a known format.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Some(format) = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .as_deref()
            .and_then(LogFormat::parse)
        {
            self.log_format = format;
        }
        self
    }

    /// The configured specification file.
    pub fn spec_path(&self) -> Result<&Path, ModelError> {
        self.spec.as_deref().ok_or_else(|| {
            ModelError::Specification(
                "No specification file configured. Pass --spec or set `spec` in modelgraph.toml"
                    .to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = AppConfig::from_toml_str("").expect("parse");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.backend, Backend::Memory);
        assert!(config.spec_path().is_err());
    }

    #[test]
    fn parses_all_fields() {
        let config = AppConfig::from_toml_str(
            r#"
            spec = "model.xml"
            backend = "redb"
            database = "store.redb"
            log_format = "json"
            "#,
        )
        .expect("parse");
        assert_eq!(config.spec.as_deref(), Some(Path::new("model.xml")));
        assert_eq!(config.backend, Backend::Redb);
        assert_eq!(config.database, PathBuf::from("store.redb"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn rejects_unknown_keys_and_values() {
        assert!(AppConfig::from_toml_str("colour = \"red\"").is_err());
        assert!(AppConfig::from_toml_str("backend = \"neo4j\"").is_err());
    }

    #[test]
    fn overrides_win() {
        let config = AppConfig::default().with_overrides(Overrides {
            backend: Some(Backend::Redb),
            database: Some(PathBuf::from("other.redb")),
            ..Overrides::default()
        });
        assert_eq!(config.backend, Backend::Redb);
        assert_eq!(config.database, PathBuf::from("other.redb"));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn log_format_names() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" text "), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("yaml"), None);
    }

    #[test]
    fn relative_paths_follow_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("modelgraph.toml");
        std::fs::write(&path, "spec = \"model.xml\"\nbackend = \"redb\"\n").expect("write");

        let config = AppConfig::load(&path).expect("load");
        assert_eq!(config.spec, Some(dir.path().join("model.xml")));
        assert_eq!(config.database, dir.path().join("modelgraph.redb"));
        assert!(AppConfig::discover(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
