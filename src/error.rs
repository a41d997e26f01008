/*!
 * Error Types
 *
 * Typed outcomes for command execution and persistence. The `Display`
 * text of a `StoreError` is exactly the RESP error line sent to clients.
 */

use thiserror::Error;

/// Argument problems detected before a command touches the store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    Arity(String),

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR offset is out of range")]
    Offset,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),
}

/// Per-call failure of a store operation
///
/// None of these are fatal; the store is left untouched whenever one
/// is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error(transparent)]
    BadArguments(#[from] ArgError),

    #[error("ERR {0}")]
    Persistence(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of the snapshot and append-log files
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot entry '{key}' is invalid: {reason}")]
    InvalidEntry { key: String, reason: String },

    #[error("persistence is not configured")]
    Disabled,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("file error: {0}")]
    File(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
