use serde::Deserialize;
use std::net::Ipv4Addr;

use super::registration::RegistrationConfig;
use super::security::CallsignFilterConfig;
use super::telemetry::LoggingConfig;
use super::timeout::TimeoutConfig;

/// Literal password value that selects EchoLink's "PUBLIC" mode: the
/// station is listed in the public directory rather than requiring a
/// shared secret.
pub const PUBLIC_PASSWORD: &str = "PUBLIC";

/// The config file's historical sentinel for "no password configured".
/// Rejected at validation, same as an empty string.
const UNSET_PASSWORD: &str = "notset";

/// Default listening port for the client-facing TCP socket.
pub const DEFAULT_PORT: u16 = 8100;

/// Immutable, validated proxy configuration.
///
/// Constructed once by [`super::loader::load_from_path`] (or directly,
/// in tests) and never mutated afterwards; every task that needs it
/// holds a shared `Arc<ProxyConfig>`.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Address the client-facing listener binds to. `None` means the
    /// wildcard address (`0.0.0.0`, or `::` if IPv6 is requested).
    #[serde(default)]
    pub bind_address: Option<String>,
    /// Client-facing TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Primary external IPv4 address: the bind address of slot 0's
    /// outbound sockets.
    #[serde(default)]
    pub external_bind_address: Option<Ipv4Addr>,
    /// Additional external IPv4 addresses; one extra slot is created
    /// per entry, bound in order after the primary.
    #[serde(default)]
    pub additional_external_bind_addresses: Vec<Ipv4Addr>,
    /// Shared secret clients authenticate with. The literal `"PUBLIC"`
    /// selects public mode (see [`PUBLIC_PASSWORD`]).
    pub password: String,
    /// Optional callsign allow/deny filter.
    #[serde(default)]
    pub callsign_filter: CallsignFilterConfig,
    /// Directory-registration settings.
    #[serde(default)]
    pub registration: RegistrationConfig,
    /// Outbound/shutdown timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Structured-logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ProxyConfig {
    /// Number of slots this configuration describes: one for the
    /// primary external address plus one per additional address.
    pub fn slot_count(&self) -> usize {
        1 + self.additional_external_bind_addresses.len()
    }

    /// All external bind addresses in slot order (primary first).
    pub fn external_addresses(&self) -> Vec<Option<Ipv4Addr>> {
        let mut addrs = Vec::with_capacity(self.slot_count());
        addrs.push(self.external_bind_address);
        addrs.extend(self.additional_external_bind_addresses.iter().map(|a| Some(*a)));
        addrs
    }

    /// True iff the configured password is the literal public-mode
    /// sentinel. Drives both the callsign-free registration `public`
    /// flag and any UI/logging distinction between modes.
    pub fn is_public(&self) -> bool {
        self.password == PUBLIC_PASSWORD
    }

    pub(crate) fn password_is_unset(&self) -> bool {
        self.password.is_empty() || self.password.eq_ignore_ascii_case(UNSET_PASSWORD)
    }
}
