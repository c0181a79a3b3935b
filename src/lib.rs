pub mod compactor;
pub mod config;
pub mod coverage;
pub mod hold;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod wal;
