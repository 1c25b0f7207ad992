//! Store and load errors.

use thiserror::Error;

/// Failure reported by a store gateway.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store unreachable or login rejected.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A uniqueness constraint rejected a write that had no conflict-ignore clause.
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    /// Any other integrity constraint (foreign key, not-null, check).
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("no instrument with serial {0}")]
    UnknownSerial(i64),

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("a transaction is already in progress")]
    TransactionActive,

    /// Bytes on the copy channel are not valid wire rows.
    #[error("malformed copy data: {0}")]
    CopyFormat(String),

    #[error(transparent)]
    Config(#[from] hm_config::ConfigError),

    /// The blocking runtime could not be started.
    #[error("runtime error: {0}")]
    Runtime(#[source] std::io::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        if let sqlx::Error::Database(db) = &e {
            match db.kind() {
                ErrorKind::UniqueViolation => {
                    return StoreError::UniqueViolation(db.message().to_string())
                }
                ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => {
                    return StoreError::Constraint(db.message().to_string())
                }
                _ => {}
            }
        }
        StoreError::Database(e)
    }
}

/// Failure of one bulk load call. Never retried automatically.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The bulk-copy channel hit an existing or repeated key. Re-run in
    /// fallback mode or with deduplicated input.
    #[error("duplicate key in bulk copy (re-run in fallback mode or deduplicate input): {0}")]
    DuplicateKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The row iterator itself failed.
    #[error("row source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LoadError {
    /// Classify an error raised on the copy channel.
    pub(crate) fn from_copy(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation(msg) => LoadError::DuplicateKey(msg),
            other => LoadError::Store(other),
        }
    }
}
