use serde::Deserialize;

/// Timeouts for outbound operations and graceful shutdown.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Outbound directory-service TCP connect timeout, milliseconds.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// How long `close()` waits for in-flight clients to drain before
    /// forcing slot teardown.
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { connect_ms: default_connect_ms(), shutdown_secs: default_shutdown_secs() }
    }
}

fn default_connect_ms() -> u64 {
    5000
}

fn default_shutdown_secs() -> u64 {
    30
}
