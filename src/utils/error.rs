use std::time::Duration;

use reqwest::StatusCode;

/// Errors returned by a relational store backend.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    /// The backend could not serve the request (connection loss, injected fault, closed store).
    #[error("Database unavailable: {0}")]
    Unavailable(String),
    /// A write violated a constraint the backend enforces.
    #[error("Constraint violated: {0}")]
    Constraint(String),
}

/// Errors returned by an object store backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Object {0} does not exist")]
    NotFound(String),
    #[error("Object store responded with status {status} for {key}")]
    Status { status: StatusCode, key: String },
    #[error("Object store call on {key} timed out after {after:?}")]
    Timeout { key: String, after: Duration },
    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// The errors surfaced by every engine operation.
///
/// Validation and not-found errors are raised before any store is touched. Storage and
/// transaction errors carry a context string naming the match (and game index, where there is
/// one) so the admin can retry the exact submission.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("{entity} {id} does not exist.")]
    NotFound { entity: &'static str, id: String },
    #[error("Storage error while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: StorageError,
    },
    #[error("Transaction error while {context}: {source}")]
    Transaction {
        context: String,
        #[source]
        source: DatabaseError,
    },
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Attaches engine context to store-level results.
pub trait ErrorContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T, EngineError>;
}

impl<T> ErrorContext<T> for Result<T, DatabaseError> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T, EngineError> {
        self.map_err(|source| EngineError::Transaction {
            context: context(),
            source,
        })
    }
}

impl<T> ErrorContext<T> for Result<T, StorageError> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T, EngineError> {
        self.map_err(|source| EngineError::Storage {
            context: context(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_part_of_the_message() {
        let result: Result<(), DatabaseError> =
            Err(DatabaseError::Unavailable("connection reset".to_string()));
        let error = result
            .context(|| "recording game 2 of match 7".to_string())
            .unwrap_err();

        assert!(matches!(error, EngineError::Transaction { .. }));
        assert_eq!(
            error.to_string(),
            "Transaction error while recording game 2 of match 7: Database unavailable: connection reset"
        );
    }

    #[test]
    fn storage_errors_keep_their_kind() {
        let result: Result<(), StorageError> = Err(StorageError::NotFound("temp/a.rec".to_string()));
        let error = result.context(|| "promoting".to_string()).unwrap_err();

        assert!(matches!(
            error,
            EngineError::Storage {
                source: StorageError::NotFound(_),
                ..
            }
        ));
    }
}
