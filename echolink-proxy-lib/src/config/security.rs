use serde::Deserialize;

/// Callsign allow/deny filtering configuration.
///
/// Patterns are `regex` source strings, compiled once at `open()` by
/// [`crate::callsign_filter::CallsignFilter`]. Both are optional; an
/// absent pattern never excludes anyone on that axis.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct CallsignFilterConfig {
    /// Regex a callsign must match to be allowed. `None` allows everyone.
    #[serde(default)]
    pub allow: Option<String>,
    /// Regex a callsign must NOT match. Evaluated before `allow`.
    #[serde(default)]
    pub deny: Option<String>,
}
