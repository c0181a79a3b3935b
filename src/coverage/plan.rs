use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::model::{CoverageRecord, SubjectId};

/// The writes needed to bring a batch of subjects up to date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub updates: Vec<Ulid>,
    pub inserts: Vec<SubjectId>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.inserts.is_empty()
    }
}

/// Diff `subjects` against the records that already exist for the target.
///
/// Subjects without a record are inserted. Subjects with one are updated
/// only when `force` is set. Repeated subjects produce a single write, in
/// first-seen order.
pub fn plan(existing: &[CoverageRecord], subjects: &[SubjectId], force: bool) -> ReconcilePlan {
    let by_subject: HashMap<SubjectId, Ulid> =
        existing.iter().map(|r| (r.subject.id, r.id)).collect();

    let mut seen = HashSet::with_capacity(subjects.len());
    let mut out = ReconcilePlan::default();
    for &sid in subjects {
        if !seen.insert(sid) {
            continue;
        }
        match by_subject.get(&sid) {
            Some(&record_id) if force => out.updates.push(record_id),
            Some(_) => {}
            None => out.inserts.push(sid),
        }
    }
    out
}
