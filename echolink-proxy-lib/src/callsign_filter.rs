//! Compiled allow/deny callsign filtering, built once at `open()`.

use regex::Regex;

use crate::config::CallsignFilterConfig;
use crate::error::{ProxyError, Result};

/// A compiled allow/deny pair. Construction is the only place a
/// malformed pattern can fail; `is_allowed` itself cannot error at
/// runtime once built from a successfully-compiled `Regex`.
#[derive(Debug, Clone)]
pub struct CallsignFilter {
    allow: Option<Regex>,
    deny: Option<Regex>,
}

impl CallsignFilter {
    /// Compiles the configured patterns. A bad pattern is a config
    /// error (`BadConfig`), surfaced at startup rather than deferred
    /// to the first match attempt.
    pub fn compile(config: &CallsignFilterConfig) -> Result<Self> {
        let allow = config
            .allow
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ProxyError::BadConfig(format!("CallsignsAllowed: {e}")))?;
        let deny = config
            .deny
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ProxyError::BadConfig(format!("CallsignsDenied: {e}")))?;
        Ok(Self { allow, deny })
    }

    /// An always-permissive filter, used when no config is supplied.
    pub fn allow_all() -> Self {
        Self { allow: None, deny: None }
    }

    /// True iff `callsign` passes both the deny and allow checks:
    /// no deny pattern matching, and (no allow pattern, or it matches).
    pub fn is_allowed(&self, callsign: &str) -> bool {
        if let Some(deny) = &self.deny {
            if deny.is_match(callsign) {
                return false;
            }
        }
        match &self.allow {
            Some(allow) => allow.is_match(callsign),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(allow: Option<&str>, deny: Option<&str>) -> CallsignFilterConfig {
        CallsignFilterConfig { allow: allow.map(String::from), deny: deny.map(String::from) }
    }

    #[test]
    fn no_patterns_allows_everyone() {
        let filter = CallsignFilter::compile(&config(None, None)).unwrap();
        assert!(filter.is_allowed("KM0H"));
        assert!(filter.is_allowed("ANYTHING"));
    }

    #[test]
    fn allow_pattern_restricts() {
        let filter = CallsignFilter::compile(&config(Some("^KM0H$"), None)).unwrap();
        assert!(filter.is_allowed("KM0H"));
        assert!(!filter.is_allowed("N0CALL"));
    }

    #[test]
    fn deny_pattern_excludes() {
        let filter = CallsignFilter::compile(&config(None, Some("^KM0H$"))).unwrap();
        assert!(!filter.is_allowed("KM0H"));
        assert!(filter.is_allowed("N0CALL"));
    }

    #[test]
    fn deny_takes_priority_over_allow() {
        let filter = CallsignFilter::compile(&config(Some("^KM0H$"), Some("^KM0H$"))).unwrap();
        assert!(!filter.is_allowed("KM0H"));
    }

    #[test]
    fn bad_pattern_is_bad_config() {
        let result = CallsignFilter::compile(&config(Some("("), None));
        assert!(matches!(result, Err(ProxyError::BadConfig(_))));
    }
}
