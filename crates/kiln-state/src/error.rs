//! Error types for the Kiln state store.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("state directory {0} is not empty and holds no kiln state")]
    NotEmpty(PathBuf),

    #[error("no kiln state at {path}: {reason}")]
    NotInitialized { path: PathBuf, reason: String },

    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to take build lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("{table} row already exists: {key}")]
    AlreadyExists { table: &'static str, key: String },

    #[error("{table} row {key} references missing {parent_table} row {parent_key}")]
    ForeignKey {
        table: &'static str,
        key: String,
        parent_table: &'static str,
        parent_key: String,
    },
}
