//! Engine-wide defaults.

use std::time::Duration;

/// Environment switch for reusing an already initialised remote runtime.
pub const REUSE_INIT_ENV: &str = "TE_RPC_REUSE_INIT";

/// Defaults shared by every handle an `Engine` creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Call timeout when neither the agent nor the caller sets one.
    pub default_timeout: Duration,
    /// Added to the timeout of operations that carry their own timeout.
    pub timeout_margin: Duration,
    /// Skip expensive re-initialisation when the arguments did not change.
    pub reuse_init: bool,
    /// How many idle buffers the log-buffer pool keeps.
    pub logbuf_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            timeout_margin: Duration::from_secs(10),
            reuse_init: false,
            logbuf_capacity: 16,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the reuse flag taken from `TE_RPC_REUSE_INIT`.
    pub fn from_env() -> Self {
        let reuse_init = std::env::var(REUSE_INIT_ENV)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        Self::default().with_reuse_init(reuse_init)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_timeout_margin(mut self, margin: Duration) -> Self {
        self.timeout_margin = margin;
        self
    }

    pub fn with_reuse_init(mut self, reuse: bool) -> Self {
        self.reuse_init = reuse;
        self
    }

    pub fn with_logbuf_capacity(mut self, capacity: usize) -> Self {
        self.logbuf_capacity = capacity;
        self
    }
}

/// `1`, `true` and `yes` (any case) are set; everything else is not.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(10));
        assert_eq!(config.timeout_margin, Duration::from_secs(10));
        assert!(!config.reuse_init);
    }

    #[test]
    fn test_fluent_setters() {
        let config = EngineConfig::new()
            .with_default_timeout(Duration::from_secs(5))
            .with_reuse_init(true)
            .with_logbuf_capacity(2);
        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert!(config.reuse_init);
        assert_eq!(config.logbuf_capacity, 2);
    }

    #[test]
    fn test_parse_flag() {
        for set in ["1", "true", "TRUE", "yes", " Yes "] {
            assert!(parse_flag(set), "{set}");
        }
        for unset in ["", "0", "no", "false", "on"] {
            assert!(!parse_flag(unset), "{unset}");
        }
    }
}
