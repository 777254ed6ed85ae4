//! Custom error types for the bridge.
//!
//! This module defines the primary error type, `BridgeError`, shared by the registry,
//! the dimension remapper, the script orchestrator and the workspace lifecycle.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidShape`**: malformed or inconsistent dimension data (too many axes, a
//!   negative axis length coming through the raw API, an element count that does not
//!   match the shape, a maps count that does not divide the composite axis).
//! - **`NotFound`** / **`DuplicateName`**: registry lookups of unknown names and
//!   registrations under a name that is still live.
//! - **`UnknownParameter`**, **`TooManyArguments`**, **`InvalidCommand`**: script lines
//!   that cannot be turned into an engine invocation.
//! - **`EngineFailure`**: the engine returned a non-zero status.
//! - **`Io`**: workspace creation, permission, mount or CFL file failures, with the path
//!   that was being touched.
//! - **`Config`**: configuration that failed to load or validate.
//!
//! Nothing here is retried. Every variant carries enough context (the failing line or
//! command and the underlying code) to be diagnosed from the log alone.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the bridge error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("No in-memory buffer named '{0}'")]
    NotFound(String),

    #[error("An in-memory buffer named '{0}' is already registered")]
    DuplicateName(String),

    #[error("Unknown script parameter '${name}' in line: {line}")]
    UnknownParameter { name: String, line: String },

    #[error("Too many arguments ({count}, limit {limit}) in line: {line}")]
    TooManyArguments {
        count: usize,
        limit: usize,
        line: String,
    },

    #[error("Invalid engine command: {0}")]
    InvalidCommand(String),

    #[error("Engine command failed with return code {code}: {command}")]
    EngineFailure { command: String, code: i32 },

    #[error("Cannot find command script: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Wrap an I/O error with the path that was being accessed.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BridgeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error was raised by the engine itself rather than by the bridge.
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, BridgeError::EngineFailure { .. })
    }
}

impl From<figment::Error> for BridgeError {
    fn from(err: figment::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}
