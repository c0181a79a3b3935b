use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::ledger::Ledger;
use crate::limits::COMPACT_CHECK_INTERVAL_SECS;

/// Compact when at least `threshold` appends have landed since the last compaction.
pub async fn compact_if_needed(ledger: &Ledger, threshold: u64) -> bool {
    let appends = ledger.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    debug!("{appends} WAL appends since last compaction, compacting");
    match ledger.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the coverage WAL from growing without bound.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(COMPACT_CHECK_INTERVAL_SECS));
    loop {
        interval.tick().await;
        compact_if_needed(&ledger, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::coverage::{reconcile, Work};
    use crate::model::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("circulate_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let ledger = Ledger::open(path.clone()).unwrap();
        let target = CoverageTarget::work(Some("summary"));

        for round in 0..3u64 {
            reconcile(&ledger, &[Work(round)], &target, &CoverageOutcome::default(), false)
                .await
                .unwrap();
        }
        assert!(!compact_if_needed(&ledger, 4).await);
        assert_eq!(ledger.wal_appends_since_compact().await, 3);

        assert!(compact_if_needed(&ledger, 3).await);
        assert_eq!(ledger.wal_appends_since_compact().await, 0);

        drop(ledger);
        let reopened = Ledger::open(path).unwrap();
        assert_eq!(reopened.records_for(&target).await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn started_ledger_compacts_in_background() {
        let data_dir = std::env::temp_dir()
            .join("circulate_test_start")
            .join(ulid::Ulid::new().to_string());
        let config = LedgerConfig {
            data_dir,
            compact_threshold: 2,
            metrics_port: None,
        };
        let ledger = Ledger::start(&config).unwrap();
        let target = CoverageTarget::work(Some("summary"));
        let outcome = CoverageOutcome::default();
        for round in 0..2u64 {
            reconcile(ledger.as_ref(), &[Work(round)], &target, &outcome, false)
                .await
                .unwrap();
        }
        assert_eq!(ledger.wal_appends_since_compact().await, 2);

        tokio::time::sleep(Duration::from_secs(COMPACT_CHECK_INTERVAL_SECS + 1)).await;
        assert_eq!(ledger.wal_appends_since_compact().await, 0);
        assert!(config.wal_path().exists());
        assert_eq!(ledger.records_for(&target).await.len(), 2);
    }
}
