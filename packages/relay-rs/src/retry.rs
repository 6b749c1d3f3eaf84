//! Retry policies: eligibility classification and backoff schedules.
//!
//! A policy answers three questions for a failing record: how many retries
//! are allowed, how long to wait before the next attempt, and whether the
//! error is worth retrying at all. The engine holds a default policy built
//! from configuration; handlers may override it via
//! [`Handler::retry_policy`](crate::Handler::retry_policy).

use std::time::Duration;

use crate::handler::HandlerError;

/// Decides retry eligibility and backoff for failed deliveries.
pub trait RetryPolicy: Send + Sync {
    /// Maximum number of retries after the initial attempt.
    fn max_retries(&self) -> i32;

    /// Delay before the attempt following failure number `failure_count`
    /// (1-based: the first failure passes 1).
    fn next_delay(&self, failure_count: i32) -> Duration;

    /// Whether the given error is worth retrying.
    fn should_retry(&self, error: &HandlerError) -> bool;
}

/// Include/exclude classification over error kind tokens.
///
/// With an include list, only listed kinds retry. With an exclude list,
/// everything except listed kinds retries. With neither, everything
/// retries except payload decode failures, which retrying cannot fix.
#[derive(Debug, Clone, Default)]
pub struct RetryClassifier {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl RetryClassifier {
    /// Retry everything except decode failures.
    pub fn retry_all() -> Self {
        Self::default()
    }

    /// Retry only the listed kinds.
    pub fn include(kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            include: kinds.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    /// Retry everything except the listed kinds.
    pub fn exclude(kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            include: Vec::new(),
            exclude: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Classify an error.
    pub fn should_retry(&self, error: &HandlerError) -> bool {
        let kind = error.kind();
        if !self.include.is_empty() {
            return self.include.iter().any(|k| k == kind);
        }
        if !self.exclude.is_empty() {
            return !self.exclude.iter().any(|k| k == kind);
        }
        !error.is_decode()
    }
}

/// Constant delay between attempts, plus optional uniform jitter.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
    jitter: Duration,
    max_retries: i32,
    classifier: RetryClassifier,
}

impl FixedBackoff {
    pub fn new(delay: Duration, max_retries: i32) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
            max_retries,
            classifier: RetryClassifier::retry_all(),
        }
    }

    /// Add uniform jitter in `[0, jitter]` to every delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

impl RetryPolicy for FixedBackoff {
    fn max_retries(&self) -> i32 {
        self.max_retries
    }

    fn next_delay(&self, _failure_count: i32) -> Duration {
        self.delay + sample_jitter(self.jitter)
    }

    fn should_retry(&self, error: &HandlerError) -> bool {
        self.classifier.should_retry(error)
    }
}

/// Exponentially growing delay, capped, plus optional uniform jitter.
///
/// `delay = min(max_delay, initial_delay * multiplier^(failure_count - 1))`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: Duration,
    max_retries: i32,
    classifier: RetryClassifier,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration, max_retries: i32) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
            jitter: Duration::ZERO,
            max_retries,
            classifier: RetryClassifier::retry_all(),
        }
    }

    /// Add uniform jitter in `[0, jitter]` to every delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn max_retries(&self) -> i32 {
        self.max_retries
    }

    fn next_delay(&self, failure_count: i32) -> Duration {
        let exponent = (failure_count - 1).max(0);
        // Work in f64 seconds; infinity from large exponents collapses to
        // the cap via min().
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped) + sample_jitter(self.jitter)
    }

    fn should_retry(&self, error: &HandlerError) -> bool {
        self.classifier.should_retry(error)
    }
}

fn sample_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(fastrand::f64() * max.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> HandlerError {
        HandlerError::delivery("timeout", "slow broker")
    }

    fn decode() -> HandlerError {
        HandlerError::decode("bad json")
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = FixedBackoff::new(Duration::from_millis(250), 3);
        assert_eq!(policy.next_delay(1), Duration::from_millis(250));
        assert_eq!(policy.next_delay(5), Duration::from_millis(250));
        assert_eq!(policy.max_retries(), 3);
    }

    #[test]
    fn test_fixed_jitter_stays_in_bounds() {
        let policy =
            FixedBackoff::new(Duration::from_millis(100), 3).with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = ExponentialBackoff::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(10),
            5,
        );
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
        assert_eq!(policy.next_delay(4), Duration::from_secs(8));
        assert_eq!(policy.next_delay(5), Duration::from_secs(10));
        assert_eq!(policy.next_delay(6), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_huge_failure_count_stays_capped() {
        let policy = ExponentialBackoff::new(
            Duration::from_secs(1),
            10.0,
            Duration::from_secs(60),
            5,
        );
        assert_eq!(policy.next_delay(500), Duration::from_secs(60));
    }

    #[test]
    fn test_default_classifier_retries_delivery_not_decode() {
        let classifier = RetryClassifier::retry_all();
        assert!(classifier.should_retry(&timeout()));
        assert!(!classifier.should_retry(&decode()));
    }

    #[test]
    fn test_include_list_only_retries_listed_kinds() {
        let classifier = RetryClassifier::include(["timeout"]);
        assert!(classifier.should_retry(&timeout()));
        assert!(!classifier.should_retry(&HandlerError::delivery("rejected", "nope")));
        assert!(!classifier.should_retry(&decode()));
    }

    #[test]
    fn test_include_list_can_opt_decode_back_in() {
        let classifier = RetryClassifier::include(["decode"]);
        assert!(classifier.should_retry(&decode()));
    }

    #[test]
    fn test_exclude_list_blocks_listed_kinds() {
        let classifier = RetryClassifier::exclude(["rejected"]);
        assert!(classifier.should_retry(&timeout()));
        assert!(!classifier.should_retry(&HandlerError::delivery("rejected", "nope")));
    }
}
