use std::path::PathBuf;
use thiserror::Error;

use crate::registry::BlockNumber;

/// Unified error type for the cascade library
#[derive(Debug, Error)]
pub enum CascadeError {
    /// The block registry is malformed or inconsistent. Fatal: no run starts.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Run or health state could not be read or written
    #[error("Persistence failed during {operation}{}", path_suffix(.path))]
    Persistence {
        operation: String,
        path: Option<PathBuf>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Database errors from the sled-backed store
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" ({})", p.display()),
        None => String::new(),
    }
}

/// Errors raised while loading or validating the block registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registry {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse registry: {message}")]
    Parse { message: String },

    #[error("Registry contains no blocks")]
    Empty,

    #[error("Duplicate block number {block_number} (ids '{first}' and '{second}')")]
    DuplicateBlockNumber {
        block_number: BlockNumber,
        first: String,
        second: String,
    },

    #[error("Duplicate block id '{id}' (blocks {first} and {second})")]
    DuplicateId {
        id: String,
        first: BlockNumber,
        second: BlockNumber,
    },

    #[error("Block {block_number} depends on unknown block {dependency}")]
    UnknownDependency {
        block_number: BlockNumber,
        dependency: BlockNumber,
    },

    #[error("Dependency cycle between blocks {blocks:?}; they can never become ready")]
    Cycle { blocks: Vec<BlockNumber> },
}

impl CascadeError {
    /// Create a persistence error for a file-backed operation
    pub fn persistence<S, E>(operation: S, path: Option<PathBuf>, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Persistence {
            operation: operation.into(),
            path,
            source: Box::new(source),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error tied to a field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization<S, E>(format: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a database error
    pub fn database<S, E>(operation: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the run can carry on after this error.
    ///
    /// Persistence and IO failures degrade durability but leave the in-memory
    /// state authoritative; registry and configuration errors abort the run.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Persistence { .. } | Self::Io { .. } | Self::Database { .. } => true,
            Self::Registry(_) | Self::Configuration { .. } => false,
            Self::Serialization { .. } | Self::Internal { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Registry(_) => "registry",
            Self::Persistence { .. } => "persistence",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Database { .. } => "database",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CascadeError>;

impl From<std::io::Error> for CascadeError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for CascadeError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for CascadeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for CascadeError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl From<anyhow::Error> for CascadeError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
