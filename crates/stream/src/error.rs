use realmstream_catalog::CatalogError;
use realmstream_common::{CellCoord, CellId};
use std::fmt;
use std::time::Duration;

/// Errors surfaced by the streaming scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("no cell definition for {0}")]
    DefinitionMissing(CellCoord),
    #[error("failed to load {cell}: {message}")]
    LoadFailure { cell: CellId, message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error("no realm session is active")]
    NoSession,
}

impl StreamError {
    pub fn load(cell: &CellId, cause: impl fmt::Display) -> Self {
        Self::LoadFailure {
            cell: cell.clone(),
            message: cause.to_string(),
        }
    }

    /// Whether the error should be shown to the user. Cancellation is expected
    /// and frequent, so it never is.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::ConsistencyViolation(_))
    }
}

impl From<CatalogError> for StreamError {
    fn from(e: CatalogError) -> Self {
        Self::Network(e.to_string())
    }
}

/// Report a broken scheduler invariant and abort.
///
/// These conditions are prevented by construction; observing one means the
/// scheduler state can no longer be trusted.
#[track_caller]
pub(crate) fn consistency_violation(what: impl fmt::Display) -> ! {
    let err = StreamError::ConsistencyViolation(what.to_string());
    tracing::error!(%err, "scheduler invariant broken");
    panic!("{err}");
}
