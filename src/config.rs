//! Configuration types.

use chrono::Duration;

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum records per outbound batch call (provider limit is 1000).
    pub batch_size: usize,
    /// Minimum lead time between scheduling a newsletter and its release.
    pub schedule_margin: Duration,
    /// Grace period during which an expired webhook token is still accepted.
    pub token_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            schedule_margin: Duration::minutes(2),
            token_grace: Duration::minutes(10),
        }
    }
}

impl SyncConfig {
    /// Clamp the configured batch size to the provider's ceiling.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, 1000)
    }
}
