use serde::Deserialize;

/// Directory-registration reporter configuration.
///
/// Defaults to a 10-minute report against `www.echolink.org`; the
/// host/path/interval overrides exist so integration tests can point
/// the reporter at a loopback stub.
#[derive(Debug, Deserialize, Clone)]
pub struct RegistrationConfig {
    /// Station name advertised to the directory. Empty disables advertising
    /// any particular identity but the reporter still runs.
    #[serde(default)]
    pub name: String,
    /// Free-text comment appended to the report.
    #[serde(default)]
    pub comment: String,
    /// Address advertised to EchoLink clients as this proxy's public
    /// address, independent of the sockets' actual bind address.
    #[serde(default)]
    pub advertised_address: Option<String>,
    /// Reporting interval in seconds. Defaults to 600 (10 minutes);
    /// configurable downward only for tests.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Directory service host. Defaults to the production EchoLink
    /// directory; overridable so tests can target a loopback stub.
    #[serde(default = "default_host")]
    pub host: String,
    /// Directory service path.
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            comment: String::new(),
            advertised_address: None,
            interval_secs: default_interval_secs(),
            host: default_host(),
            path: default_path(),
        }
    }
}

fn default_interval_secs() -> u64 {
    600
}

fn default_host() -> String {
    "www.echolink.org".to_string()
}

fn default_path() -> String {
    "/proxypost.jsp".to_string()
}
