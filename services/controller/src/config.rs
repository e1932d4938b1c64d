//! Configuration for the controller.

use std::time::Duration;

use anyhow::{Context, Result};
use tfop_reconcile::{DEFAULT_EXPECTATIONS_TIMEOUT, DEFAULT_RESYNC_INTERVAL};

use crate::control::DEFAULT_CALL_TIMEOUT;
use crate::exit_code::RetryableExitCodes;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of concurrent reconcile workers.
    pub threads: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Domain suffix appended to peer addresses in the rendezvous document.
    pub cluster_domain: Option<String>,

    /// Exit codes that cause an `ExitCode` unit to be recreated.
    pub retryable_exit_codes: RetryableExitCodes,

    /// Interval at which every job is re-queued.
    pub resync_interval: Duration,

    /// Age after which outstanding expectations are ignored.
    pub expectations_timeout: Duration,

    /// Bound on each create/delete call.
    pub call_timeout: Duration,

    /// Path of a JSON job submitted at startup.
    pub job_manifest: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 1,
            log_level: "info".to_string(),
            cluster_domain: None,
            retryable_exit_codes: RetryableExitCodes::default(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            expectations_timeout: DEFAULT_EXPECTATIONS_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            job_manifest: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for unset variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let threads = lookup("TFOP_THREADS")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.threads);

        let log_level = lookup("TFOP_LOG_LEVEL").unwrap_or(defaults.log_level);

        let cluster_domain = lookup("CUSTOM_CLUSTER_DOMAIN").filter(|d| !d.is_empty());

        let retryable_exit_codes = match lookup("TFOP_RETRYABLE_EXIT_CODES") {
            Some(raw) => raw
                .parse::<RetryableExitCodes>()
                .map_err(anyhow::Error::msg)
                .context("invalid TFOP_RETRYABLE_EXIT_CODES")?,
            None => defaults.retryable_exit_codes,
        };

        let resync_interval = lookup("TFOP_RESYNC_INTERVAL_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map_or(defaults.resync_interval, Duration::from_secs);

        let expectations_timeout = lookup("TFOP_EXPECTATIONS_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .map_or(defaults.expectations_timeout, Duration::from_secs);

        let call_timeout = lookup("TFOP_CALL_TIMEOUT_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map_or(defaults.call_timeout, Duration::from_millis);

        let job_manifest = lookup("TFOP_JOB_MANIFEST").filter(|p| !p.is_empty());

        Ok(Self {
            threads,
            log_level,
            cluster_domain,
            retryable_exit_codes,
            resync_interval,
            expectations_timeout,
            call_timeout,
            job_manifest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.threads, 1);
        assert_eq!(config.log_level, "info");
        assert!(config.cluster_domain.is_none());
        assert!(config.retryable_exit_codes.is_retryable(137));
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.expectations_timeout, Duration::from_secs(300));
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert!(config.job_manifest.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("TFOP_THREADS", "4"),
            ("CUSTOM_CLUSTER_DOMAIN", "tf.training.org"),
            ("TFOP_RETRYABLE_EXIT_CODES", "1,130-140"),
            ("TFOP_RESYNC_INTERVAL_SECS", "5"),
            ("TFOP_CALL_TIMEOUT_MS", "250"),
        ])
        .unwrap();

        assert_eq!(config.threads, 4);
        assert_eq!(config.cluster_domain.as_deref(), Some("tf.training.org"));
        assert!(config.retryable_exit_codes.is_retryable(1));
        assert!(!config.retryable_exit_codes.is_retryable(128));
        assert_eq!(config.resync_interval, Duration::from_secs(5));
        assert_eq!(config.call_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_garbage_falls_back_or_fails() {
        let config = config(&[("TFOP_THREADS", "zero"), ("CUSTOM_CLUSTER_DOMAIN", "")]).unwrap();
        assert_eq!(config.threads, 1);
        assert!(config.cluster_domain.is_none());

        let err = Config::from_lookup(|name| {
            (name == "TFOP_RETRYABLE_EXIT_CODES").then(|| "oops".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("TFOP_RETRYABLE_EXIT_CODES"));
    }
}
