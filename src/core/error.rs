use thiserror::Error;

/// Domain errors surfaced by the store and the components built on it.
///
/// Duplicate-suppressed ingests and lost job claims are deliberately NOT
/// errors: the first is reported as `stored = false`, the second is skipped
/// by the sweep.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed, unknown or revoked agent key. Rejected with no side effects.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// Attempted transition out of a terminal state. Reported to the caller,
    /// never silently dropped; the row is left untouched.
    #[error("{entity} {id} is {state}, which is terminal")]
    TerminalState {
        entity: &'static str,
        id: String,
        state: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Connectivity/timeout class failures. Every core operation is safe to
    /// retry in full: verification is read-only, ingestion is idempotent on
    /// doc_key, claims and transitions are conditional single updates.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn terminal(entity: &'static str, id: &str, state: &str) -> Self {
        StoreError::TerminalState {
            entity,
            id: id.to_string(),
            state: state.to_string(),
        }
    }

    pub fn not_found(entity: &'static str, id: &str) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
