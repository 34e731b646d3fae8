use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Failure modes of the lock protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// The lock is held by another client, or the caller cancelled the
    /// acquisition before it completed.
    #[error("cannot acquire lock")]
    NotAcquired,

    /// The conditional update matched zero rows: this handle no longer
    /// owns the lock (released, stolen, or deleted).
    #[error("lock is already released")]
    AlreadyReleased,

    /// No row exists for the requested lock name.
    #[error("lock not found")]
    NotFound,

    /// The heartbeat frequency must be no more than half of the lease
    /// duration, or the lock may expire before the refresher runs.
    /// A ratio of 4x or more is recommended.
    #[error("lease duration is too small for the configured heartbeat frequency")]
    DurationTooSmall,

    /// The database could not admit a serializable schedule for this
    /// transaction (SQLSTATE 40001). Retried transparently by the
    /// client; public operations never surface this variant.
    #[error("{context}: serializable transaction conflict: {source}")]
    SerializationFailure {
        context: &'static str,
        source: tokio_postgres::Error,
    },

    /// A network-layer failure. The caller decides whether to retry.
    #[error("{context}: database unavailable: {source}")]
    Unavailable {
        context: &'static str,
        source: tokio_postgres::Error,
    },

    /// Any other database error, wrapped with a contextual message.
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        source: tokio_postgres::Error,
    },

    /// The caller's cancellation token fired while a database call was
    /// in flight. The attempt is abandoned and its transaction rolled
    /// back. Distinct from [`Error::NotAcquired`], which covers
    /// cancellation observed between attempts.
    #[error("{context}: cancelled by the caller")]
    Cancelled { context: &'static str },

    /// A pooled connection could not be checked out.
    #[error("cannot check out a database connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// The operation did not complete within one lease duration.
    #[error("{context}: deadline of one lease duration exceeded")]
    Timeout { context: &'static str },
}

impl Error {
    /// Whether the retry loop should transparently reissue the attempt.
    pub(crate) fn is_serialization_failure(&self) -> bool {
        matches!(self, Error::SerializationFailure { .. })
    }
}

/// Maps a driver error onto the closed failure set: serialization
/// conflicts become retryable, network failures become `Unavailable`,
/// everything else is surfaced wrapped with the call-site context.
pub(crate) fn classify(source: tokio_postgres::Error, context: &'static str) -> Error {
    if source.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE) {
        Error::SerializationFailure { context, source }
    } else if has_io_source(&source) {
        Error::Unavailable { context, source }
    } else {
        Error::Database { context, source }
    }
}

fn has_io_source(err: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if cause.is::<std::io::Error>() {
            return true;
        }
        source = cause.source();
    }
    false
}
