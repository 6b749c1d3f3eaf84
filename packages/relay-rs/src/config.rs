//! Engine configuration.
//!
//! Every option has a default; `validate` runs at build time and refuses
//! configurations the engine cannot honor. The partition count deserves
//! special care: it is fixed for the lifetime of the deployment because
//! records persist their partition number, and a mismatch against the
//! partition table is a fatal startup error.

use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::retry::{ExponentialBackoff, FixedBackoff, RetryClassifier, RetryPolicy};

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Master switch; a disabled engine starts nothing.
    pub enabled: bool,
    /// How often the dispatch loop ticks.
    pub poll_interval: Duration,
    /// Maximum distinct keys pulled per partition per tick.
    pub batch_size: usize,
    /// Number of partitions. Fixed after the first deployment.
    pub partition_count: u32,
    /// Global cap on concurrently processed keys.
    pub concurrency_limit: usize,
    /// How long shutdown waits for in-flight work to drain.
    pub graceful_shutdown_timeout: Duration,
    pub locking: LockingConfig,
    pub instance: InstanceConfig,
    pub partitions: PartitionConfig,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            partition_count: 32,
            concurrency_limit: 16,
            graceful_shutdown_timeout: Duration::from_secs(30),
            locking: LockingConfig::default(),
            instance: InstanceConfig::default(),
            partitions: PartitionConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Refuse configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.partition_count < 1 {
            return Err(EngineError::InvalidConfig(
                "partition_count must be at least 1".into(),
            ));
        }
        if self.batch_size < 1 {
            return Err(EngineError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.concurrency_limit < 1 {
            return Err(EngineError::InvalidConfig(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(EngineError::InvalidConfig("poll_interval must be non-zero".into()));
        }
        if self.locking.refresh_threshold >= self.locking.extension {
            return Err(EngineError::InvalidConfig(
                "locking.refresh_threshold must be shorter than locking.extension".into(),
            ));
        }
        if self.instance.heartbeat_timeout <= self.instance.heartbeat_interval {
            return Err(EngineError::InvalidConfig(
                "instance.heartbeat_timeout must exceed instance.heartbeat_interval".into(),
            ));
        }
        self.retry.validate()?;
        Ok(())
    }
}

/// Per-key lock lease tuning.
#[derive(Debug, Clone)]
pub struct LockingConfig {
    /// Lease length granted on acquire and on each renewal.
    pub extension: Duration,
    /// Renew when less than this much lease time remains.
    pub refresh_threshold: Duration,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            extension: Duration::from_secs(10),
            refresh_threshold: Duration::from_secs(3),
        }
    }
}

/// Instance registration tuning.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub heartbeat_interval: Duration,
    /// An instance missing heartbeats for longer than this is dead.
    pub heartbeat_timeout: Duration,
    /// Advertised hostname; falls back to `$HOSTNAME`, then `localhost`.
    pub hostname: Option<String>,
    /// Advertised port; informational only.
    pub port: u16,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            hostname: None,
            port: 0,
        }
    }
}

/// Partition coordination tuning.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// How often ownership is recomputed and leases claimed.
    pub rebalance_interval: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            rebalance_interval: Duration::from_secs(10),
        }
    }
}

/// Which backoff family the default retry policy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicyKind {
    Fixed,
    Exponential,
}

/// Default retry policy configuration. Handlers may override the built
/// policy per id via [`Handler::retry_policy`](crate::Handler::retry_policy).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub policy: RetryPolicyKind,
    /// Retries after the initial attempt.
    pub max_retries: i32,
    /// Delay for the fixed policy.
    pub fixed_delay: Duration,
    /// First delay for the exponential policy.
    pub initial_delay: Duration,
    /// Growth factor for the exponential policy.
    pub multiplier: f64,
    /// Ceiling for the exponential policy.
    pub max_delay: Duration,
    /// Uniform jitter in `[0, jitter]` added to every delay.
    pub jitter: Duration,
    /// Retry only these error kinds. Mutually exclusive with
    /// `exclude_errors`.
    pub include_errors: Vec<String>,
    /// Retry everything except these error kinds.
    pub exclude_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicyKind::Exponential,
            max_retries: 3,
            fixed_delay: Duration::from_secs(5),
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: Duration::ZERO,
            include_errors: Vec::new(),
            exclude_errors: Vec::new(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.max_retries < 0 {
            return Err(EngineError::InvalidConfig(
                "retry.max_retries must be non-negative".into(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(EngineError::InvalidConfig(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if !self.include_errors.is_empty() && !self.exclude_errors.is_empty() {
            return Err(EngineError::InvalidConfig(
                "retry.include_errors and retry.exclude_errors are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    fn classifier(&self) -> RetryClassifier {
        if !self.include_errors.is_empty() {
            RetryClassifier::include(self.include_errors.iter().cloned())
        } else if !self.exclude_errors.is_empty() {
            RetryClassifier::exclude(self.exclude_errors.iter().cloned())
        } else {
            RetryClassifier::retry_all()
        }
    }

    /// Build the default retry policy.
    pub fn build(&self) -> Arc<dyn RetryPolicy> {
        match self.policy {
            RetryPolicyKind::Fixed => Arc::new(
                FixedBackoff::new(self.fixed_delay, self.max_retries)
                    .with_jitter(self.jitter)
                    .with_classifier(self.classifier()),
            ),
            RetryPolicyKind::Exponential => Arc::new(
                ExponentialBackoff::new(
                    self.initial_delay,
                    self.multiplier,
                    self.max_delay,
                    self.max_retries,
                )
                .with_jitter(self.jitter)
                .with_classifier(self.classifier()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let config = EngineConfig {
            partition_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refresh_threshold_must_undercut_extension() {
        let config = EngineConfig {
            locking: LockingConfig {
                extension: Duration::from_secs(5),
                refresh_threshold: Duration::from_secs(5),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let config = EngineConfig {
            instance: InstanceConfig {
                heartbeat_interval: Duration::from_secs(30),
                heartbeat_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_include_and_exclude_are_mutually_exclusive() {
        let config = EngineConfig {
            retry: RetryConfig {
                include_errors: vec!["timeout".into()],
                exclude_errors: vec!["rejected".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_fixed_policy() {
        let retry = RetryConfig {
            policy: RetryPolicyKind::Fixed,
            fixed_delay: Duration::from_millis(100),
            max_retries: 2,
            ..Default::default()
        };
        let policy = retry.build();
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(100));
    }

    #[test]
    fn test_build_exponential_policy_with_exclusions() {
        let retry = RetryConfig {
            exclude_errors: vec!["rejected".into()],
            ..Default::default()
        };
        let policy = retry.build();
        assert!(policy.should_retry(&HandlerError::delivery("timeout", "x")));
        assert!(!policy.should_retry(&HandlerError::delivery("rejected", "x")));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
    }
}
