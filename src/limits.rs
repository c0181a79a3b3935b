/// Operation labels are stored in a 255-character column.
pub const MAX_OPERATION_LEN: usize = 255;
pub const MAX_SERVICE_NAME_LEN: usize = 255;
pub const MAX_EXCEPTION_LEN: usize = 64 * 1024;

/// Writes per store commit. Larger reconciles are split into chunks.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Compactor poll interval in seconds.
pub const COMPACT_CHECK_INTERVAL_SECS: u64 = 30;
