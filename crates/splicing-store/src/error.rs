// Error types for the ordered keyed store

use std::fmt;

use thiserror::Error;

/// The kind of value a key holds. A key never changes kind while it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Scalar,
    Set,
    List,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Scalar => "scalar",
            ValueKind::Set => "set",
            ValueKind::List => "list",
        })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("key `{key}` holds a {actual} value, not a {expected}")]
    WrongKind {
        key: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("invalid key segment `{0}`")]
    InvalidKey(String),

    #[error("value at `{key}` is not {expected}")]
    UnexpectedValue { key: String, expected: &'static str },
}

pub type StoreResult<T> = Result<T, StoreError>;
