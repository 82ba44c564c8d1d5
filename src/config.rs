//! Runtime configuration.
//!
//! Parsing a configuration *file* into a [`Config`] is out of scope for this
//! crate (see the crate-level docs); this module only defines the struct
//! every component is handed at startup, with `Default` values chosen to
//! match the reference implementation's own defaults.

use std::net::SocketAddr;
use std::time::Duration;

/// Bounds on the elastic classifier worker pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Minimum number of workers kept running at all times.
    pub low: usize,
    /// Maximum number of workers the pool may grow to under load.
    pub high: usize,
    /// Path to the external redirector program to spawn for each worker.
    pub program: String,
    /// Arguments passed to the redirector program.
    pub args: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            low: 4,
            high: 16,
            program: "/usr/bin/redirector".to_owned(),
            args: Vec::new(),
        }
    }
}

/// DNS resolver tunables.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Nameservers to query, tried in order.
    pub nameservers: Vec<SocketAddr>,
    /// How long a cached answer remains valid.
    pub ttl: Duration,
    /// How long an outstanding query may remain unanswered before it is
    /// timed out and the client receives a `503 dns.html` rewrite.
    pub timeout: Duration,
    /// Maximum number of cache entries examined per maintenance tick when
    /// sweeping for expiry.
    pub expire: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            nameservers: Vec::new(),
            ttl: Duration::from_secs(300),
            timeout: Duration::from_secs(5),
            expire: 100,
        }
    }
}

/// Top-level configuration for the proxy.
#[derive(Clone, Debug)]
pub struct Config {
    /// Addresses the proxy listens for client connections on.
    pub listen: Vec<SocketAddr>,
    /// Optional admin/web listener. Kept as a separate socket from the
    /// proxy listeners, but subject to the same admission ceiling: every
    /// listening socket is gated by `max_clients` (spec.md §3).
    pub listen_web: Option<SocketAddr>,
    /// Ceiling on simultaneously open client connections.
    pub max_clients: usize,
    /// Listening socket backlog.
    pub backlog: i32,
    /// Classifier worker pool bounds.
    pub pool: PoolConfig,
    /// DNS resolver tunables.
    pub resolver: ResolverConfig,
    /// Interval of the supervisor's maintenance tick (cache expiry, pool
    /// provisioning, stats sampling, timeout sweep).
    pub alarm_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: Vec::new(),
            listen_web: None,
            max_clients: 1024,
            backlog: 1024,
            pool: PoolConfig::default(),
            resolver: ResolverConfig::default(),
            alarm_time: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Validates cross-field invariants that `Default` alone cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen.is_empty() {
            return Err(crate::Error::new_config(ConfigError(
                "no listen addresses configured".to_owned(),
            )));
        }
        if self.pool.low == 0 {
            return Err(crate::Error::new_config(ConfigError(
                "pool.low must be at least 1".to_owned(),
            )));
        }
        if self.pool.high < self.pool.low {
            return Err(crate::Error::new_config(ConfigError(
                "pool.high must be >= pool.low".to_owned(),
            )));
        }
        if self.max_clients == 0 {
            return Err(crate::Error::new_config(ConfigError(
                "max_clients must be at least 1".to_owned(),
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_invalid_without_listeners() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn high_below_low_is_rejected() {
        let mut config = Config::default();
        config.listen.push("127.0.0.1:3128".parse().unwrap());
        config.pool.high = 1;
        config.pool.low = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sane_config_validates() {
        let mut config = Config::default();
        config.listen.push("127.0.0.1:3128".parse().unwrap());
        assert!(config.validate().is_ok());
    }
}
