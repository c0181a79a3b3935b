use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::plan::plan;
use super::store::{CoverageBatch, CoverageStore};
use super::{CoverageError, CoverageFilter, StoreError, Subject};

/// What a reconcile call wrote and what it skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled<S> {
    /// Records created or overwritten by this call.
    pub records: Vec<CoverageRecord>,
    /// Input subjects that already had a record and were left alone, in
    /// input order.
    pub untouched: Vec<S>,
}

impl<S> Reconciled<S> {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            untouched: Vec::new(),
        }
    }
}

/// Output of the diff-then-commit rounds for one chunk of subjects.
#[derive(Default)]
struct Applied {
    records: Vec<CoverageRecord>,
    inserted: usize,
    updated: usize,
}

impl Applied {
    fn absorb(&mut self, other: Applied) {
        self.records.extend(other.records);
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

fn validate_target<S: Subject>(target: &CoverageTarget) -> Result<(), CoverageError> {
    if target.kind != S::KIND {
        return Err(CoverageError::InvalidTarget("target kind does not match subject kind"));
    }
    match target.kind {
        SubjectKind::Identifier if target.data_source.is_none() => {
            return Err(CoverageError::InvalidTarget("identifier coverage requires a data source"));
        }
        SubjectKind::Work if target.data_source.is_some() => {
            return Err(CoverageError::InvalidTarget("work coverage has no data source"));
        }
        SubjectKind::Work if target.scope.is_some() => {
            return Err(CoverageError::InvalidTarget("work coverage has no collection scope"));
        }
        _ => {}
    }
    if let Some(ref op) = target.operation
        && op.len() > MAX_OPERATION_LEN
    {
        return Err(CoverageError::LimitExceeded("operation label too long"));
    }
    Ok(())
}

fn validate_outcome(outcome: &CoverageOutcome) -> Result<(), CoverageError> {
    if let Some(ref e) = outcome.exception
        && e.len() > MAX_EXCEPTION_LEN
    {
        return Err(CoverageError::LimitExceeded("exception message too long"));
    }
    Ok(())
}

/// Diff, then commit. A uniqueness violation means another batch inserted
/// one of our keys between the two phases; the next round sees that record
/// as existing coverage. Each lost race moves at least one subject out of
/// the insert set, so `subject_ids.len() + 1` rounds always suffice against
/// a store that honours the uniqueness contract.
async fn apply<St>(
    store: &St,
    target: &CoverageTarget,
    subject_ids: &[SubjectId],
    outcome: &CoverageOutcome,
    timestamp: Ms,
    force: bool,
) -> Result<Applied, CoverageError>
where
    St: CoverageStore + ?Sized,
{
    let mut last_conflict = None;
    for attempt in 1..=subject_ids.len() + 1 {
        let existing = store.lookup(target, subject_ids).await?;
        let todo = plan(&existing, subject_ids, force);
        if todo.is_empty() {
            return Ok(Applied::default());
        }

        let (inserted, updated) = (todo.inserts.len(), todo.updates.len());
        let batch = CoverageBatch {
            target: target.clone(),
            updates: todo.updates,
            inserts: todo.inserts,
            status: outcome.status,
            timestamp,
            exception: outcome.exception.clone(),
        };
        match store.commit(batch).await {
            Ok(records) => {
                return Ok(Applied {
                    records,
                    inserted,
                    updated,
                });
            }
            Err(StoreError::UniqueViolation(key)) => {
                metrics::counter!(observability::COVERAGE_CONFLICTS_TOTAL).increment(1);
                warn!("coverage commit lost race on {key} (attempt {attempt}), re-planning");
                last_conflict = Some(key);
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Only reachable when the store reports conflicts for keys its lookup
    // never returns.
    match last_conflict {
        Some(key) => Err(StoreError::UniqueViolation(key).into()),
        None => Ok(Applied::default()),
    }
}

/// Run `apply` over `subject_ids` in store-sized chunks.
async fn apply_chunked<St>(
    store: &St,
    target: &CoverageTarget,
    subject_ids: &[SubjectId],
    outcome: &CoverageOutcome,
    force: bool,
) -> Result<Applied, CoverageError>
where
    St: CoverageStore + ?Sized,
{
    let timestamp = outcome.timestamp.unwrap_or_else(now_ms);
    let mut applied = Applied::default();
    for chunk in subject_ids.chunks(MAX_BATCH_SIZE) {
        applied.absorb(apply(store, target, chunk, outcome, timestamp, force).await?);
    }
    Ok(applied)
}

/// Make sure every subject has a coverage record under `target` reflecting
/// `outcome`.
///
/// Subjects with no record get one. Subjects that already have one are
/// overwritten when `force` is set and reported back as untouched
/// otherwise. A concurrent insert of the same key counts as existing
/// coverage, never as an error. Calling this twice with the same arguments
/// and no `force` writes nothing the second time.
///
/// Batches larger than `MAX_BATCH_SIZE` are committed in chunks; each
/// chunk is atomic on its own.
pub async fn reconcile<S, St>(
    store: &St,
    subjects: &[S],
    target: &CoverageTarget,
    outcome: &CoverageOutcome,
    force: bool,
) -> Result<Reconciled<S>, CoverageError>
where
    S: Subject + Clone,
    St: CoverageStore + ?Sized,
{
    if subjects.is_empty() {
        return Ok(Reconciled::empty());
    }
    if let Err(e) = validate_target::<S>(target).and_then(|()| validate_outcome(outcome)) {
        metrics::counter!(observability::COVERAGE_BATCHES_TOTAL, "status" => "invalid")
            .increment(1);
        return Err(e);
    }

    let mut seen = HashSet::with_capacity(subjects.len());
    let subject_ids: Vec<SubjectId> = subjects
        .iter()
        .map(Subject::subject_id)
        .filter(|sid| seen.insert(*sid))
        .collect();
    let applied = match apply_chunked(store, target, &subject_ids, outcome, force).await {
        Ok(applied) => applied,
        Err(e) => {
            metrics::counter!(observability::COVERAGE_BATCHES_TOTAL, "status" => "error")
                .increment(1);
            return Err(e);
        }
    };

    metrics::counter!(observability::COVERAGE_BATCHES_TOTAL, "status" => "ok").increment(1);
    metrics::counter!(observability::COVERAGE_RECORDS_INSERTED_TOTAL)
        .increment(applied.inserted as u64);
    metrics::counter!(observability::COVERAGE_RECORDS_UPDATED_TOTAL)
        .increment(applied.updated as u64);

    let affected: HashSet<SubjectId> = applied.records.iter().map(|r| r.subject.id).collect();
    let untouched: Vec<S> = subjects
        .iter()
        .filter(|s| !affected.contains(&s.subject_id()))
        .cloned()
        .collect();

    debug!(
        kind = target.kind.as_str(),
        operation = target.operation.as_deref().unwrap_or(""),
        inserted = applied.inserted,
        updated = applied.updated,
        untouched = untouched.len(),
        "coverage batch reconciled"
    );

    Ok(Reconciled {
        records: applied.records,
        untouched,
    })
}

/// The record for `subject` under `target`, if there is one.
pub async fn lookup<S, St>(
    store: &St,
    subject: &S,
    target: &CoverageTarget,
) -> Result<Option<CoverageRecord>, CoverageError>
where
    S: Subject,
    St: CoverageStore + ?Sized,
{
    validate_target::<S>(target)?;
    let found = store.lookup(target, &[subject.subject_id()]).await?;
    Ok(found.into_iter().next())
}

/// Create or overwrite the record for a single subject. Returns the record
/// and whether it was newly created. The whole outcome is written, so a
/// success clears the exception left by an earlier failure.
pub async fn add_for<S, St>(
    store: &St,
    subject: &S,
    target: &CoverageTarget,
    outcome: &CoverageOutcome,
) -> Result<(CoverageRecord, bool), CoverageError>
where
    S: Subject,
    St: CoverageStore + ?Sized,
{
    validate_target::<S>(target)?;
    validate_outcome(outcome)?;

    let timestamp = outcome.timestamp.unwrap_or_else(now_ms);
    let applied = apply(store, target, &[subject.subject_id()], outcome, timestamp, true).await?;
    let is_new = applied.inserted > 0;
    let record = applied
        .records
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::Backend("commit returned no record".into()))?;
    Ok((record, is_new))
}

/// Subjects that do not count as covered under `target` according to
/// `filter`, in input order.
pub async fn uncovered<S, St>(
    store: &St,
    subjects: &[S],
    target: &CoverageTarget,
    filter: &CoverageFilter,
) -> Result<Vec<S>, CoverageError>
where
    S: Subject + Clone,
    St: CoverageStore + ?Sized,
{
    if subjects.is_empty() {
        return Ok(Vec::new());
    }
    validate_target::<S>(target)?;

    let subject_ids: Vec<SubjectId> = subjects.iter().map(Subject::subject_id).collect();
    let records: HashMap<SubjectId, CoverageRecord> = store
        .lookup(target, &subject_ids)
        .await?
        .into_iter()
        .map(|r| (r.subject.id, r))
        .collect();

    Ok(subjects
        .iter()
        .filter(|s| !filter.is_covered(records.get(&s.subject_id())))
        .cloned()
        .collect())
}
