use thiserror::Error;
use tokio_postgres::error::SqlState;

/// The crate's error type.
///
/// The first three variants are the fault classes the retry policy cares
/// about: `Collision` and `UniqueViolation` are retryable with fresh
/// randomness, `ConcurrentUpdate` is a true conflict and never retried.
#[derive(Error, Debug)]
pub enum Error {
    /// A freshly generated selector/validator landed on an occupied slot.
    #[error("identifier collision, retry with fresh randomness")]
    Collision,

    /// The stored nonce no longer matches: a concurrent writer already
    /// mutated the session. The caller must reload before retrying.
    #[error("concurrent update detected")]
    ConcurrentUpdate,

    /// A unique index rejected the insert.
    #[error("unique constraint violation")]
    UniqueViolation,

    /// A session accessor was called before `load()` completed.
    #[error("session not loaded")]
    NotLoaded,

    /// A Redis error other than the scripted fault replies.
    #[error("Redis error: {0}")]
    Redis(#[source] redis::RedisError),

    /// A database error other than a unique violation.
    #[error("Database error: {0}")]
    Database(#[source] tokio_postgres::Error),

    /// A connection pool error.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// An internal invariant failed.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `Error` as the error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the fault is safe to retry with fresh randomness.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Collision | Error::UniqueViolation)
    }
}

impl From<redis::RedisError> for Error {
    /// Folds the scripted fault replies into their fault classes. The
    /// session scripts answer `-RETRY ...` on a hash-slot collision and
    /// `-RACE ...` on a nonce mismatch; everything else passes through.
    fn from(e: redis::RedisError) -> Self {
        match e.code() {
            Some("RETRY") => Error::Collision,
            Some("RACE") => Error::ConcurrentUpdate,
            _ => Error::Redis(e),
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            Error::UniqueViolation
        } else {
            Error::Database(e)
        }
    }
}
