use ulid::Ulid;

use crate::model::CoverageKey;

/// Failures reported by a `CoverageStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An update named a record id the store does not hold.
    NotFound(Ulid),
    /// An insert collided with an existing record for the same key.
    UniqueViolation(CoverageKey),
    LimitExceeded(&'static str),
    WalError(String),
    /// Catch-all for store implementations backed by something else.
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "coverage record not found: {id}"),
            StoreError::UniqueViolation(key) => {
                write!(f, "coverage record already exists for {key}")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
            StoreError::Backend(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageError {
    /// The target cannot form a valid key for this subject kind. Not retried.
    InvalidTarget(&'static str),
    LimitExceeded(&'static str),
    Store(StoreError),
}

impl std::fmt::Display for CoverageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoverageError::InvalidTarget(msg) => write!(f, "invalid coverage target: {msg}"),
            CoverageError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            CoverageError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CoverageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoverageError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for CoverageError {
    fn from(e: StoreError) -> Self {
        CoverageError::Store(e)
    }
}
