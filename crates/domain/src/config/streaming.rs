use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming post writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Minimum time between two post updates.
    #[serde(default = "d_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Flush early once this much text is buffered.
    #[serde(default = "d_flush_bytes")]
    pub flush_bytes: usize,
    /// Inter-event timeout for services that do not set their own.
    #[serde(default = "d_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: d_flush_interval_ms(),
            flush_bytes: d_flush_bytes(),
            inactivity_timeout_secs: d_inactivity_timeout_secs(),
        }
    }
}

fn d_flush_interval_ms() -> u64 {
    200
}
fn d_flush_bytes() -> usize {
    4096
}
fn d_inactivity_timeout_secs() -> u64 {
    10
}
