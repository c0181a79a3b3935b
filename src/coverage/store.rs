use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::StoreError;

/// One transaction's worth of coverage writes. Every record touched by the
/// batch ends up with the same status, timestamp and exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageBatch {
    pub target: CoverageTarget,
    /// Existing records to overwrite.
    pub updates: Vec<Ulid>,
    /// Subjects that get a new record under `target`.
    pub inserts: Vec<SubjectId>,
    pub status: CoverageStatus,
    pub timestamp: Ms,
    pub exception: Option<String>,
}

impl CoverageBatch {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.inserts.is_empty()
    }
}

/// Storage seam for coverage records.
///
/// Implementations must enforce one record per `CoverageKey` and apply a
/// batch atomically: either every update and insert lands, or none do.
#[async_trait]
pub trait CoverageStore: Send + Sync {
    /// Records under `target` for any of `subjects`. Order is unspecified.
    async fn lookup(
        &self,
        target: &CoverageTarget,
        subjects: &[SubjectId],
    ) -> Result<Vec<CoverageRecord>, StoreError>;

    /// Apply `batch` in one transaction and return every record it wrote.
    /// An insert for a key that already has a record fails the whole batch
    /// with `StoreError::UniqueViolation`.
    async fn commit(&self, batch: CoverageBatch) -> Result<Vec<CoverageRecord>, StoreError>;
}
