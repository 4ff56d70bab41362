// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Default subject prefix for cluster traffic.
pub const DEFAULT_CLUSTER_PREFIX: &str = "mls";

/// Default NATS server for the networked transport.
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

/// Cluster configuration shared by the event bus, election and replicated store.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Prefix prepended to every cluster subject (`<prefix>.<name>`).
    pub cluster_prefix: String,
    /// NATS server URL, used by the `nats` transport.
    pub nats_url: String,
    /// Interval between leader election heartbeats.
    pub heartbeat_interval: Duration,
    /// Timeout for RPC calls such as function invocations.
    pub request_timeout: Duration,
    /// Timeout for replicated store connect, sync and write acknowledgment.
    pub sync_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_prefix: DEFAULT_CLUSTER_PREFIX.to_string(),
            nats_url: DEFAULT_NATS_URL.to_string(),
            heartbeat_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(10),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `MLS_CLUSTER_PREFIX`: subject prefix (default: `mls`)
    /// - `MLS_NATS_URL`: NATS server (default: `nats://127.0.0.1:4222`)
    /// - `MLS_HEARTBEAT_INTERVAL_MS`: election heartbeat interval (default: 1000)
    /// - `MLS_REQUEST_TIMEOUT_MS`: RPC timeout (default: 10000)
    /// - `MLS_SYNC_TIMEOUT_MS`: store sync timeout (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let cluster_prefix = match std::env::var("MLS_CLUSTER_PREFIX") {
            Ok(prefix) if prefix.trim().is_empty() => {
                return Err(ConfigError::Invalid(
                    "MLS_CLUSTER_PREFIX",
                    "must not be empty",
                ));
            }
            Ok(prefix) => prefix,
            Err(_) => defaults.cluster_prefix,
        };

        let nats_url = std::env::var("MLS_NATS_URL").unwrap_or(defaults.nats_url);

        let heartbeat_interval = duration_ms_var(
            "MLS_HEARTBEAT_INTERVAL_MS",
            defaults.heartbeat_interval,
        )?;
        let request_timeout = duration_ms_var("MLS_REQUEST_TIMEOUT_MS", defaults.request_timeout)?;
        let sync_timeout = duration_ms_var("MLS_SYNC_TIMEOUT_MS", defaults.sync_timeout)?;

        Ok(Self {
            cluster_prefix,
            nats_url,
            heartbeat_interval,
            request_timeout,
            sync_timeout,
        })
    }

    /// Set the subject prefix.
    pub fn with_cluster_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cluster_prefix = prefix.into();
        self
    }

    /// Set the NATS server URL.
    pub fn with_nats_url(mut self, url: impl Into<String>) -> Self {
        self.nats_url = url.into();
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the RPC timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the store sync timeout.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

/// Parse a positive millisecond duration from the environment.
pub fn duration_ms_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(name, "must be a positive integer"))?;
            if ms == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than zero"));
            }
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_all(guard: &mut EnvGuard) {
        guard.remove("MLS_CLUSTER_PREFIX");
        guard.remove("MLS_NATS_URL");
        guard.remove("MLS_HEARTBEAT_INTERVAL_MS");
        guard.remove("MLS_REQUEST_TIMEOUT_MS");
        guard.remove("MLS_SYNC_TIMEOUT_MS");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        let config = ClusterConfig::from_env().unwrap();

        assert_eq!(config.cluster_prefix, "mls");
        assert_eq!(config.nats_url, "nats://127.0.0.1:4222");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.sync_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("MLS_CLUSTER_PREFIX", "prod");
        guard.set("MLS_NATS_URL", "nats://nats.internal:4222");
        guard.set("MLS_HEARTBEAT_INTERVAL_MS", "250");
        guard.set("MLS_REQUEST_TIMEOUT_MS", "5000");
        guard.set("MLS_SYNC_TIMEOUT_MS", "2000");

        let config = ClusterConfig::from_env().unwrap();

        assert_eq!(config.cluster_prefix, "prod");
        assert_eq!(config.nats_url, "nats://nats.internal:4222");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.request_timeout, Duration::from_millis(5000));
        assert_eq!(config.sync_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn test_config_invalid_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("MLS_HEARTBEAT_INTERVAL_MS", "soon");

        let err = ClusterConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("MLS_HEARTBEAT_INTERVAL_MS", _)
        ));
    }

    #[test]
    fn test_config_zero_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("MLS_REQUEST_TIMEOUT_MS", "0");

        assert!(ClusterConfig::from_env().is_err());
    }

    #[test]
    fn test_config_empty_prefix_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("MLS_CLUSTER_PREFIX", "  ");

        let err = ClusterConfig::from_env().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for MLS_CLUSTER_PREFIX: must not be empty"
        );
    }

    #[test]
    fn test_builder_pattern() {
        let config = ClusterConfig::default()
            .with_cluster_prefix("test")
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_request_timeout(Duration::from_secs(1))
            .with_sync_timeout(Duration::from_secs(2));

        assert_eq!(config.cluster_prefix, "test");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert_eq!(config.sync_timeout, Duration::from_secs(2));
    }
}
