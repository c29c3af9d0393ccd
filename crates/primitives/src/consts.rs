//! Engine-wide constants.

/// User operation queue defaults
pub mod queue {
    /// Maximum number of messages processed in one batch
    pub const BATCH_SIZE: usize = 10;
    /// Wait after the first message of a batch so concurrent submissions coalesce
    pub const BATCH_COALESCE_MS: u64 = 250;
    /// Default maximum retries for a message before its error is surfaced
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default queue buffer size
    pub const DEFAULT_BUFFER_SIZE: usize = 1000;
}

/// WebSocket connection pool settings
pub mod fabric {
    use std::time::Duration;

    /// Per-client send buffer, in frames; slow clients past this are dropped
    pub const SEND_BUFFER_SIZE: usize = 256;
    /// Heartbeat ping interval
    pub const PING_INTERVAL: Duration = Duration::from_secs(54);
    /// Read deadline, refreshed on any inbound frame
    pub const READ_DEADLINE: Duration = Duration::from_secs(60);
}

/// Chain gateway settings
pub mod gateway {
    /// Number of recent gas estimates kept for the fallback average
    pub const GAS_ESTIMATE_WINDOW: usize = 5;
    /// Gas limit used when estimation fails and no history is available
    pub const FALLBACK_GAS_LIMIT: u64 = 500_000;
    /// Blocks of fee history used for fee estimation
    pub const FEE_HISTORY_BLOCKS: u64 = 5;
    /// Priority fee percentile requested from fee history
    pub const FEE_HISTORY_PERCENTILE: f64 = 50.0;
    /// Seconds to wait for a submitted bundle to be mined
    pub const TX_WAIT_SECS: u64 = 16;
    /// Delay before resubscribing after a dropped log subscription
    pub const RESUBSCRIBE_DELAY_SECS: u64 = 1;
}

/// Timeout reconciler settings
pub mod reconciler {
    /// Sweep interval
    pub const TICK_SECS: u64 = 60;
    /// Only timeout operations older than this many minutes are reconciled
    pub const TIMEOUT_AGE_MINUTES: i64 = 2;
}

/// Log store settings
pub mod logs {
    /// In-progress (sending/pending) records older than this are purged
    pub const IN_PROGRESS_TTL_SECS: i64 = 30;
}

/// Block timestamp cache settings
pub mod indexer {
    /// Seconds a block timestamp stays cached after the block is first seen
    pub const BLOCK_CACHE_TTL_SECS: u64 = 60;
}
