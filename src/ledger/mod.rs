mod writer;
#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::compactor::run_compactor;
use crate::config::LedgerConfig;
use crate::coverage::{CoverageBatch, CoverageStore, StoreError};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use writer::{wal_writer_loop, WalCommand};

pub type SharedTargetState = Arc<RwLock<TargetState>>;

type StampKey = (String, Option<CollectionId>);

/// All records for one coverage target, one per subject.
#[derive(Debug, Default)]
pub struct TargetState {
    records: HashMap<SubjectId, CoverageRecord>,
    ids: HashMap<Ulid, SubjectId>,
}

impl TargetState {
    /// Insert or replace the record for `record.subject`. Returns the id
    /// of a replaced record if the id changed.
    fn upsert(&mut self, record: CoverageRecord) -> Option<Ulid> {
        let id = record.id;
        self.ids.insert(id, record.subject.id);
        match self.records.insert(record.subject.id, record) {
            Some(prev) if prev.id != id => {
                self.ids.remove(&prev.id);
                Some(prev.id)
            }
            _ => None,
        }
    }

    pub fn get(&self, subject: SubjectId) -> Option<&CoverageRecord> {
        self.records.get(&subject)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// In-memory coverage store backed by a write-ahead log.
///
/// Commits on one target are serialised by that target's write lock, which
/// is also where the one-record-per-key rule is checked. Each committed
/// batch is a single WAL event.
pub struct Ledger {
    targets: DashMap<CoverageTarget, SharedTargetState>,
    /// Reverse lookup: record id → target.
    record_index: DashMap<Ulid, CoverageTarget>,
    stamps: RwLock<HashMap<StampKey, Ms>>,
    /// Commits hold this shared; compaction takes it exclusively so no
    /// append can slip between the snapshot and the file swap.
    compaction_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Ledger {
    /// Replay the WAL at `wal_path` and start the background writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!("discarding torn or corrupt tail of {}", wal_path.display());
            Wal::truncate(&wal_path, replay.valid_len)?;
        }

        let mut targets: HashMap<CoverageTarget, TargetState> = HashMap::new();
        let mut stamps: HashMap<StampKey, Ms> = HashMap::new();
        for event in replay.events {
            match event {
                Event::CoverageCommitted { records } => {
                    for record in records {
                        targets.entry(record.target.clone()).or_default().upsert(record);
                    }
                }
                Event::MonitorStamped {
                    service,
                    collection,
                    timestamp,
                } => {
                    stamps.insert((service, collection), timestamp);
                }
            }
        }

        let record_index = DashMap::new();
        let shared = DashMap::new();
        let mut record_count = 0usize;
        for (target, state) in targets {
            record_count += state.len();
            for id in state.ids.keys() {
                record_index.insert(*id, target.clone());
            }
            shared.insert(target, Arc::new(RwLock::new(state)));
        }
        info!(
            "coverage ledger opened from {}: {} targets, {} records, {} stamps",
            wal_path.display(),
            shared.len(),
            record_count,
            stamps.len()
        );

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            targets: shared,
            record_index,
            stamps: RwLock::new(stamps),
            compaction_gate: RwLock::new(()),
            wal_tx,
        })
    }

    /// Open the ledger under `config.data_dir`, install the metrics
    /// exporter and start the background compactor.
    pub fn start(config: &LedgerConfig) -> io::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        observability::init(config.metrics_port).map_err(io::Error::other)?;
        let ledger = Arc::new(Self::open(config.wal_path())?);
        tokio::spawn(run_compactor(ledger.clone(), config.compact_threshold));
        info!("coverage ledger started, compacting past {} appends", config.compact_threshold);
        Ok(ledger)
    }

    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    fn get_target(&self, target: &CoverageTarget) -> Option<SharedTargetState> {
        self.targets.get(target).map(|e| e.value().clone())
    }

    /// Every record under `target`, ordered by subject id.
    pub async fn records_for(&self, target: &CoverageTarget) -> Vec<CoverageRecord> {
        let Some(state) = self.get_target(target) else {
            return Vec::new();
        };
        let guard = state.read().await;
        let mut records: Vec<CoverageRecord> = guard.records.values().cloned().collect();
        records.sort_by_key(|r| r.subject.id);
        records
    }

    pub async fn get_record(&self, id: &Ulid) -> Option<CoverageRecord> {
        let target = self.record_index.get(id).map(|e| e.value().clone())?;
        let state = self.get_target(&target)?;
        let guard = state.read().await;
        let subject = guard.ids.get(id)?;
        guard.records.get(subject).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.record_index.len()
    }

    // ── Monitor timestamps ───────────────────────────────────

    /// Record that `service` ran, at `date` or now. Returns the stored value.
    pub async fn stamp(
        &self,
        service: &str,
        collection: Option<CollectionId>,
        date: Option<Ms>,
    ) -> Result<Ms, StoreError> {
        if service.len() > MAX_SERVICE_NAME_LEN {
            return Err(StoreError::LimitExceeded("service name too long"));
        }
        let timestamp = date.unwrap_or_else(now_ms);
        let _gate = self.compaction_gate.read().await;
        let mut stamps = self.stamps.write().await;
        self.wal_append(Event::MonitorStamped {
            service: service.to_string(),
            collection,
            timestamp,
        })
        .await?;
        stamps.insert((service.to_string(), collection), timestamp);
        Ok(timestamp)
    }

    pub async fn stamp_value(&self, service: &str, collection: Option<CollectionId>) -> Option<Ms> {
        self.stamps
            .read()
            .await
            .get(&(service.to_string(), collection))
            .copied()
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with one event per live target plus one per stamp.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;

        let states: Vec<SharedTargetState> =
            self.targets.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(states.len());
        for state in states {
            let guard = state.read().await;
            if guard.is_empty() {
                continue;
            }
            let mut records: Vec<CoverageRecord> = guard.records.values().cloned().collect();
            records.sort_by_key(|r| r.subject.id);
            events.push(Event::CoverageCommitted { records });
        }
        for ((service, collection), timestamp) in self.stamps.read().await.iter() {
            events.push(Event::MonitorStamped {
                service: service.clone(),
                collection: *collection,
                timestamp: *timestamp,
            });
        }

        let event_count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted coverage WAL to {event_count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl CoverageStore for Ledger {
    async fn lookup(
        &self,
        target: &CoverageTarget,
        subjects: &[SubjectId],
    ) -> Result<Vec<CoverageRecord>, StoreError> {
        let Some(state) = self.get_target(target) else {
            return Ok(Vec::new());
        };
        let guard = state.read().await;
        let mut seen = HashSet::with_capacity(subjects.len());
        Ok(subjects
            .iter()
            .filter(|sid| seen.insert(**sid))
            .filter_map(|sid| guard.records.get(sid).cloned())
            .collect())
    }

    async fn commit(&self, batch: CoverageBatch) -> Result<Vec<CoverageRecord>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if batch.updates.len() + batch.inserts.len() > MAX_BATCH_SIZE {
            return Err(StoreError::LimitExceeded("batch too large"));
        }

        let _gate = self.compaction_gate.read().await;
        let state = self
            .targets
            .entry(batch.target.clone())
            .or_default()
            .value()
            .clone();
        let mut guard = state.write().await;

        // Phase 1: validate the whole batch against current state.
        let mut records = Vec::with_capacity(batch.updates.len() + batch.inserts.len());
        for id in &batch.updates {
            let existing = guard
                .ids
                .get(id)
                .and_then(|sid| guard.records.get(sid))
                .ok_or(StoreError::NotFound(*id))?;
            records.push(CoverageRecord {
                status: batch.status,
                timestamp: batch.timestamp,
                exception: batch.exception.clone(),
                ..existing.clone()
            });
        }
        let mut fresh = HashSet::with_capacity(batch.inserts.len());
        for &sid in &batch.inserts {
            if guard.records.contains_key(&sid) || !fresh.insert(sid) {
                return Err(StoreError::UniqueViolation(CoverageKey {
                    subject: SubjectRef::new(batch.target.kind, sid),
                    target: batch.target.clone(),
                }));
            }
            records.push(CoverageRecord {
                id: Ulid::new(),
                subject: SubjectRef::new(batch.target.kind, sid),
                target: batch.target.clone(),
                status: batch.status,
                timestamp: batch.timestamp,
                exception: batch.exception.clone(),
            });
        }

        // Phase 2: persist as one event, then apply.
        self.wal_append(Event::CoverageCommitted {
            records: records.clone(),
        })
        .await?;
        for record in &records {
            self.record_index.insert(record.id, batch.target.clone());
            if let Some(displaced) = guard.upsert(record.clone()) {
                self.record_index.remove(&displaced);
            }
        }
        Ok(records)
    }
}
