//! Error types for key-value operations.

use common::{Retryable, StorageError};

use crate::model::Key;

/// Error type for key-value operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A zero-length key was supplied.
    EmptyKey,

    /// No record exists under the key.
    KeyNotFound(Key),

    /// The current value did not match the expected one.
    ValueChanged(Key),

    /// A batch request was larger than allowed.
    LimitExceeded { requested: usize, limit: usize },

    /// Errors from the underlying storage, including aborted transactions.
    Storage(StorageError),

    /// The operation did not finish within the configured timeout.
    Cancelled(String),

    /// Several failures that all have to be reported.
    Combined(Vec<Error>),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::EmptyKey => write!(f, "Invalid key: key is empty"),
            Error::KeyNotFound(key) => write!(f, "Key not found: {}", key),
            Error::ValueChanged(key) => write!(f, "Value changed: {}", key),
            Error::LimitExceeded { requested, limit } => {
                write!(f, "Limit exceeded: requested {}, limit {}", requested, limit)
            }
            Error::Storage(err) => write!(f, "{}", err),
            Error::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            Error::Combined(errors) => {
                write!(f, "Multiple errors: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl Error {
    /// Merges the outcome of an operation with the outcome of releasing its
    /// resources, keeping every failure.
    pub(crate) fn combine<T>(result: Result<T>, cleanup: Result<()>) -> Result<T> {
        match (result, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(first), Err(second)) => Err(Error::Combined(vec![first, second])),
        }
    }
}

/// Result type alias for key-value operations.
pub type Result<T> = std::result::Result<T, Error>;
