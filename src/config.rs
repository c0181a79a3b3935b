use std::path::PathBuf;

use crate::hold::LoanPolicy;
use crate::model::{DAY_MS, Ms};

/// Parse an environment variable, treating unset or malformed values as absent.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("CIRCULATE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            compact_threshold: env_parse("CIRCULATE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: env_parse("CIRCULATE_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("coverage.wal")
    }
}

impl LoanPolicy {
    /// Periods are configured in whole days. Unset means unbounded.
    pub fn from_env() -> Self {
        Self {
            default_loan_period: env_parse::<u32>("CIRCULATE_DEFAULT_LOAN_DAYS").map(days),
            default_reservation_period: env_parse::<u32>("CIRCULATE_DEFAULT_RESERVATION_DAYS")
                .map(days),
        }
    }
}

fn days(n: u32) -> Ms {
    Ms::from(n) * DAY_MS
}
