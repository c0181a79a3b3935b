use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Durations use the same unit.
pub type Ms = i64;

pub type SubjectId = u64;
pub type DataSourceId = u32;
pub type CollectionId = u32;

pub const DAY_MS: Ms = 86_400_000;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

// ── Coverage status ──────────────────────────────────────────────

/// Outcome of a coverage attempt. No status is sticky: a later write
/// for the same key always replaces the earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoverageStatus {
    Registered,
    Success,
    TransientFailure,
    PersistentFailure,
}

impl CoverageStatus {
    pub const ALL: [CoverageStatus; 4] = [
        CoverageStatus::Registered,
        CoverageStatus::Success,
        CoverageStatus::TransientFailure,
        CoverageStatus::PersistentFailure,
    ];

    /// Anything other than `Registered` means an attempt was made.
    pub const PREVIOUSLY_ATTEMPTED: [CoverageStatus; 3] = [
        CoverageStatus::Success,
        CoverageStatus::TransientFailure,
        CoverageStatus::PersistentFailure,
    ];

    /// Transient failures are excluded so they get retried.
    pub const DEFAULT_COUNT_AS_COVERED: [CoverageStatus; 2] =
        [CoverageStatus::Success, CoverageStatus::PersistentFailure];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageStatus::Registered => "registered",
            CoverageStatus::Success => "success",
            CoverageStatus::TransientFailure => "transient failure",
            CoverageStatus::PersistentFailure => "persistent failure",
        }
    }
}

impl fmt::Display for CoverageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Keys ─────────────────────────────────────────────────────────

/// Which owner table a coverage record annotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectKind {
    Identifier,
    Work,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Identifier => "identifier",
            SubjectKind::Work => "work",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub kind: SubjectKind,
    pub id: SubjectId,
}

impl SubjectRef {
    pub fn new(kind: SubjectKind, id: SubjectId) -> Self {
        Self { kind, id }
    }
}

/// Everything in a coverage key except the subject. All records for one
/// target share an owner table and an operation context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoverageTarget {
    pub kind: SubjectKind,
    /// Only identifier coverage carries a data source.
    pub data_source: Option<DataSourceId>,
    pub operation: Option<String>,
    /// Collection scope, identifier coverage only.
    pub scope: Option<CollectionId>,
}

impl CoverageTarget {
    pub fn identifier(data_source: DataSourceId, operation: Option<&str>) -> Self {
        Self {
            kind: SubjectKind::Identifier,
            data_source: Some(data_source),
            operation: operation.map(str::to_string),
            scope: None,
        }
    }

    pub fn work(operation: Option<&str>) -> Self {
        Self {
            kind: SubjectKind::Work,
            data_source: None,
            operation: operation.map(str::to_string),
            scope: None,
        }
    }

    pub fn in_collection(mut self, collection: CollectionId) -> Self {
        self.scope = Some(collection);
        self
    }
}

/// Uniquely identifies one coverage record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoverageKey {
    pub subject: SubjectRef,
    pub target: CoverageTarget,
}

impl fmt::Display for CoverageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.subject.kind.as_str(), self.subject.id)?;
        if let Some(ds) = self.target.data_source {
            write!(f, " data_source={ds}")?;
        }
        if let Some(ref op) = self.target.operation {
            write!(f, " operation=\"{op}\"")?;
        }
        if let Some(c) = self.target.scope {
            write!(f, " collection={c}")?;
        }
        Ok(())
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub id: Ulid,
    pub subject: SubjectRef,
    pub target: CoverageTarget,
    pub status: CoverageStatus,
    pub timestamp: Ms,
    pub exception: Option<String>,
}

impl CoverageRecord {
    pub fn key(&self) -> CoverageKey {
        CoverageKey {
            subject: self.subject,
            target: self.target.clone(),
        }
    }
}

impl fmt::Display for CoverageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.subject.kind {
            SubjectKind::Identifier => "CoverageRecord",
            SubjectKind::Work => "WorkCoverageRecord",
        };
        write!(f, "<{label}: {} {} status=\"{}\"", self.timestamp, self.key(), self.status)?;
        if let Some(ref e) = self.exception {
            write!(f, " exception=\"{e}\"")?;
        }
        f.write_str(">")
    }
}

/// The status/timestamp/exception triple written by one coverage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageOutcome {
    pub status: CoverageStatus,
    /// `None` means "now" at reconcile time.
    pub timestamp: Option<Ms>,
    pub exception: Option<String>,
}

impl Default for CoverageOutcome {
    fn default() -> Self {
        Self::new(CoverageStatus::Success)
    }
}

impl CoverageOutcome {
    pub fn new(status: CoverageStatus) -> Self {
        Self {
            status,
            timestamp: None,
            exception: None,
        }
    }

    pub fn at(mut self, timestamp: Ms) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}

// ── WAL record format ────────────────────────────────────────────

/// The event types. This is the WAL record format; one committed batch is
/// exactly one event so a batch is never half-replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Upsert each record by key. Used for both reconcile batches and compaction.
    CoverageCommitted { records: Vec<CoverageRecord> },
    MonitorStamped {
        service: String,
        collection: Option<CollectionId>,
        timestamp: Ms,
    },
}
