use std::fs;
use std::path::Path;

use crate::error::{ProxyError, Result};

use super::root::ProxyConfig;
use super::validator::validate;

/// Loads and validates a [`ProxyConfig`] from a TOML file on disk.
///
/// Every optional field in `ProxyConfig` carries a `serde` default, so
/// an absent key never leaves a field in an unspecified state.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<ProxyConfig> {
    let text = fs::read_to_string(path.as_ref()).map_err(|e| {
        ProxyError::BadConfig(format!("failed to read {}: {e}", path.as_ref().display()))
    })?;
    load_from_str(&text)
}

/// As [`load_from_path`], but from an in-memory TOML string. Exposed
/// primarily for tests.
pub fn load_from_str(text: &str) -> Result<ProxyConfig> {
    let config: ProxyConfig =
        toml::from_str(text).map_err(|e| ProxyError::BadConfig(format!("failed to parse config: {e}")))?;
    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_from_str_applies_defaults_for_absent_tables() {
        let config = load_from_str(r#"password = "PUBLIC""#).unwrap();
        assert_eq!(config.port, super::super::DEFAULT_PORT);
        assert_eq!(config.registration.interval_secs, 600);
        assert_eq!(config.timeouts.connect_ms, 5000);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn load_from_str_rejects_invalid_config() {
        let result = load_from_str(r#"password = "notset""#);
        assert!(matches!(result, Err(ProxyError::BadConfig(_))));
    }

    #[test]
    fn load_from_path_reads_a_real_file_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"password = "PUBLIC""#).unwrap();
        writeln!(file, "port = 8101").unwrap();

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.port, 8101);
    }

    #[test]
    fn load_from_path_reports_missing_file() {
        let result = load_from_path("/nonexistent/path/to/echolink-proxy.toml");
        assert!(matches!(result, Err(ProxyError::BadConfig(_))));
    }
}
