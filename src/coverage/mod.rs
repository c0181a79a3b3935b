mod error;
mod plan;
mod reconcile;
mod store;

pub use error::{CoverageError, StoreError};
pub use plan::{plan, ReconcilePlan};
pub use reconcile::{add_for, lookup, reconcile, uncovered, Reconciled};
pub use store::{CoverageBatch, CoverageStore};

use crate::model::*;

/// An entity that coverage records can annotate: it has a stable id and
/// belongs to exactly one owner table.
pub trait Subject {
    const KIND: SubjectKind;

    fn subject_id(&self) -> SubjectId;

    fn subject_ref(&self) -> SubjectRef {
        SubjectRef::new(Self::KIND, self.subject_id())
    }
}

/// Opaque handle to an identifier row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(pub SubjectId);

impl Subject for Identifier {
    const KIND: SubjectKind = SubjectKind::Identifier;

    fn subject_id(&self) -> SubjectId {
        self.0
    }
}

/// Opaque handle to a work row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Work(pub SubjectId);

impl Subject for Work {
    const KIND: SubjectKind = SubjectKind::Work;

    fn subject_id(&self) -> SubjectId {
        self.0
    }
}

/// Decides whether an existing record counts as coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageFilter {
    pub count_as_covered: Vec<CoverageStatus>,
    /// Records older than this cutoff do not count, whatever their status.
    pub covered_since: Option<Ms>,
}

impl Default for CoverageFilter {
    fn default() -> Self {
        Self {
            count_as_covered: CoverageStatus::DEFAULT_COUNT_AS_COVERED.to_vec(),
            covered_since: None,
        }
    }
}

impl CoverageFilter {
    /// Accept only `statuses`. An empty list falls back to the default set.
    pub fn only(statuses: &[CoverageStatus]) -> Self {
        if statuses.is_empty() {
            return Self::default();
        }
        Self {
            count_as_covered: statuses.to_vec(),
            covered_since: None,
        }
    }

    pub fn since(mut self, cutoff: Ms) -> Self {
        self.covered_since = Some(cutoff);
        self
    }

    pub fn is_covered(&self, record: Option<&CoverageRecord>) -> bool {
        let Some(record) = record else { return false };
        self.count_as_covered.contains(&record.status)
            && self.covered_since.is_none_or(|cutoff| record.timestamp >= cutoff)
    }
}
