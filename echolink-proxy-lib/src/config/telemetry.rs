use serde::Deserialize;

/// Structured-logging configuration.
///
/// Controls the `tracing_subscriber::fmt` subscriber built once at
/// process start by the binary crate's `init_tracing`.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// A `tracing_subscriber::EnvFilter` directive, e.g. `"info"` or
    /// `"echolink_proxy_lib=debug,warn"`. Overridden at runtime by the
    /// `RUST_LOG` environment variable when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Include the module path (tracing "target") in formatted output.
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: default_filter(), show_target: false }
    }
}

fn default_filter() -> String {
    "info".to_string()
}
