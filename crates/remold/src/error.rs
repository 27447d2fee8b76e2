use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Postgres(#[source] tokio_postgres::Error),

    /// The connection dropped or the server asked us to retry. Nothing from the
    /// interrupted transaction survived, so rerunning from scratch is safe.
    #[error("transient connection failure: {0}")]
    TransientConnection(#[source] tokio_postgres::Error),

    #[error("statement timed out: {0}")]
    Timeout(#[source] tokio_postgres::Error),

    #[error("integrity violation on {object}: {detail}")]
    IntegrityViolation {
        object: String,
        detail: String,
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    #[error("{migration}: schema matches no known state (observed: {observed})")]
    UnknownSchemaState { migration: String, observed: String },

    #[error("{migration}: ambiguous schema state '{state}': {detail}")]
    AmbiguousState {
        migration: String,
        state: String,
        detail: String,
    },

    #[error("{migration}: target shape not reached, unmet: {}", unmet.join(", "))]
    TargetNotReached {
        migration: String,
        unmet: Vec<String>,
    },

    #[error("{migration} failed in state '{state}' at `{operation}`: {source}")]
    OperationFailed {
        migration: String,
        state: String,
        operation: String,
        source: Box<Error>,
    },

    #[error("invalid migration list: {0}")]
    InvalidDefinitions(String),

    /// `pending` cannot be applied (or reverted) while the newer `applied`
    /// migration is recorded in the ledger.
    #[error("migration {pending} cannot run while newer migration {applied} is applied")]
    OutOfOrder { pending: String, applied: String },

    #[error("migration {0} has not been applied")]
    NotApplied(String),

    #[error("ledger references unknown migration {0}")]
    UnknownMigration(String),

    /// Failure reported by a [`Session`](crate::Session) that is not backed
    /// by Postgres.
    #[error("session backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the whole migration is expected to help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientConnection(_) | Error::Timeout(_) => true,
            Error::OperationFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Classified state and failing operation, when the failure happened while
    /// running a migration step.
    pub fn operation_context(&self) -> Option<(&str, &str)> {
        match self {
            Error::OperationFailed {
                state, operation, ..
            } => Some((state, operation)),
            _ => None,
        }
    }

    /// The innermost error, skipping operation context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::OperationFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// SQLSTATEs after which the server expects the client to retry.
const RETRYABLE: &[SqlState] = &[
    SqlState::ADMIN_SHUTDOWN,
    SqlState::CRASH_SHUTDOWN,
    SqlState::CANNOT_CONNECT_NOW,
    SqlState::T_R_SERIALIZATION_FAILURE,
    SqlState::T_R_DEADLOCK_DETECTED,
];

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        let io_failure =
            std::error::Error::source(&err).is_some_and(|source| source.is::<std::io::Error>());
        if err.is_closed() || io_failure {
            return Error::TransientConnection(err);
        }

        let Some(code) = err.code() else {
            return Error::Postgres(err);
        };

        if *code == SqlState::QUERY_CANCELED {
            return Error::Timeout(err);
        }

        // Class 08: connection exceptions.
        if code.code().starts_with("08") || RETRYABLE.contains(code) {
            return Error::TransientConnection(err);
        }

        // Class 23: integrity constraint violations.
        if code.code().starts_with("23") || *code == SqlState::DEPENDENT_OBJECTS_STILL_EXIST {
            let (object, detail) = match err.as_db_error() {
                Some(db) => (
                    db.constraint()
                        .or(db.table())
                        .unwrap_or("unknown object")
                        .to_string(),
                    db.message().to_string(),
                ),
                None => ("unknown object".to_string(), code.code().to_string()),
            };
            return Error::IntegrityViolation {
                object,
                detail,
                source: Some(err),
            };
        }

        Error::Postgres(err)
    }
}
