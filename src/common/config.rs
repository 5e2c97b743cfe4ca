//! Backend-agnostic configuration pieces

use std::time::Duration;

/// Default partition when none is configured or passed per call.
pub const DEFAULT_PARTITION_KEY: &str = "default";

/// Options for the auxiliary polling consumer.
#[derive(Debug, Clone)]
pub struct AuxiliaryConfig {
    /// Polling cadence
    pub check_interval: Duration,
    /// Max undelivered rows fetched per tick
    pub batch_size: i64,
    /// Delay before retrying a row whose publish failed
    pub wait_after_failed_publish: Duration,
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            batch_size: 10,
            wait_after_failed_publish: Duration::from_secs(1),
        }
    }
}
