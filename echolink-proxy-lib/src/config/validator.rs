use std::net::Ipv4Addr;

use regex::Regex;

use crate::error::{ProxyError, Result};

use super::root::ProxyConfig;

/// Validates a freshly-parsed [`ProxyConfig`], enforcing every
/// invariant the data model calls out. Called unconditionally by
/// [`super::loader::load_from_path`]; exposed separately so callers who
/// build a `ProxyConfig` directly (e.g. tests) can validate it too.
pub fn validate(config: &ProxyConfig) -> Result<()> {
    if config.password_is_unset() {
        return Err(ProxyError::BadConfig(
            "Password must be set (use \"PUBLIC\" for public mode)".to_string(),
        ));
    }

    if !config.additional_external_bind_addresses.is_empty() {
        match config.external_bind_address {
            None => {
                return Err(ProxyError::BadConfig(
                    "ExternalBindAddress is required when AdditionalExternalBindAddresses is set"
                        .to_string(),
                ));
            }
            Some(addr) if addr == Ipv4Addr::UNSPECIFIED => {
                return Err(ProxyError::BadConfig(
                    "ExternalBindAddress must not be 0.0.0.0 when additional bind addresses are set"
                        .to_string(),
                ));
            }
            Some(_) => {}
        }
    }

    if let Some(pattern) = &config.callsign_filter.allow {
        Regex::new(pattern)
            .map_err(|e| ProxyError::BadConfig(format!("CallsignsAllowed is not a valid regex: {e}")))?;
    }
    if let Some(pattern) = &config.callsign_filter.deny {
        Regex::new(pattern)
            .map_err(|e| ProxyError::BadConfig(format!("CallsignsDenied is not a valid regex: {e}")))?;
    }

    if config.timeouts.connect_ms == 0 {
        return Err(ProxyError::BadConfig("timeouts.connect_ms must be > 0".to_string()));
    }

    Ok(())
}
