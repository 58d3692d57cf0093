//! Retry policies with capped exponential backoff, one per error kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lantern_common::{Error, ErrorKind};

/// Decides from an error's characteristics whether its class is retryable.
#[derive(Clone)]
pub enum RetryCondition {
    /// Every error is retryable.
    Always,
    /// No error is retryable.
    Never,
    /// Connectivity and transport failures.
    ConnectionFailures,
    /// Remote failures with a 5xx status. 4xx responses are never retried.
    ServerErrors,
    /// Caller-supplied predicate.
    Custom(Arc<dyn Fn(&Error) -> bool + Send + Sync>),
}

impl RetryCondition {
    /// Evaluate the condition for `err`.
    pub fn allows(&self, err: &Error) -> bool {
        match self {
            RetryCondition::Always => true,
            RetryCondition::Never => false,
            RetryCondition::ConnectionFailures => {
                matches!(err, Error::Network(_) | Error::Io(_))
            }
            RetryCondition::ServerErrors => matches!(err, Error::Api { status, .. } if *status >= 500),
            RetryCondition::Custom(predicate) => predicate(err),
        }
    }
}

impl fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryCondition::Always => f.write_str("Always"),
            RetryCondition::Never => f.write_str("Never"),
            RetryCondition::ConnectionFailures => f.write_str("ConnectionFailures"),
            RetryCondition::ServerErrors => f.write_str("ServerErrors"),
            RetryCondition::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Backoff schedule for one error kind.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff. Values below 1.0 are treated as 1.0.
    pub backoff_multiplier: f64,
    /// Whether to add +/- 25% jitter to delays.
    pub jitter: bool,
    /// Which errors of this kind may be retried at all.
    pub condition: RetryCondition,
}

impl RetryPolicy {
    /// Create a new policy retrying every error up to `max_retries` times.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
            condition: RetryCondition::Always,
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::new(0).with_condition(RetryCondition::Never)
    }

    /// A zero-delay policy, for deterministic tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries)
            .with_base_delay(Duration::ZERO)
            .with_max_delay(Duration::ZERO)
    }

    /// Connectivity failures: 3 retries, 1s doubling up to 10s.
    pub fn network() -> Self {
        Self::new(3)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_condition(RetryCondition::ConnectionFailures)
    }

    /// Remote failures: 2 retries on 5xx only, 2s doubling up to 8s.
    pub fn api() -> Self {
        Self::new(2)
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(8))
            .with_condition(RetryCondition::ServerErrors)
    }

    /// Runtime faults: a single retry after 500ms.
    pub fn runtime() -> Self {
        Self::new(1)
            .with_base_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(5))
    }

    /// Built-in policy for an error kind.
    pub fn default_for(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Network => Self::network(),
            ErrorKind::Api => Self::api(),
            ErrorKind::Runtime => Self::runtime(),
            ErrorKind::Validation | ErrorKind::Auth | ErrorKind::Permission => Self::never(),
        }
    }

    /// Set initial delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the retryability condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Calculate delay for a given attempt number:
    /// `min(base_delay * backoff_multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0);
        let base_delay =
            self.base_delay.as_millis() as f64 * multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Whether the `attempt`-th retry (0-based) of `err` is allowed.
    pub fn allows(&self, attempt: u32, err: &Error) -> bool {
        attempt < self.max_retries && self.condition.allows(err)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Process-wide table of retry policies keyed by error kind.
///
/// Policies change only through [`register`](Self::register) and
/// [`register_all`](Self::register_all).
pub struct RetryPolicyEngine {
    policies: RwLock<HashMap<ErrorKind, RetryPolicy>>,
}

impl RetryPolicyEngine {
    /// Create an engine loaded with the built-in policy for every kind.
    pub fn new() -> Self {
        let policies = ErrorKind::ALL
            .into_iter()
            .map(|kind| (kind, RetryPolicy::default_for(kind)))
            .collect();
        Self {
            policies: RwLock::new(policies),
        }
    }

    /// Create an engine using `policy` for every kind.
    pub fn uniform(policy: RetryPolicy) -> Self {
        let engine = Self::new();
        engine.register_all(policy);
        engine
    }

    /// Replace the policy for `kind`.
    pub fn register(&self, kind: ErrorKind, policy: RetryPolicy) {
        self.policies.write().unwrap().insert(kind, policy);
    }

    /// Replace the policy for every kind.
    pub fn register_all(&self, policy: RetryPolicy) {
        let mut policies = self.policies.write().unwrap();
        for kind in ErrorKind::ALL {
            policies.insert(kind, policy.clone());
        }
    }

    /// Current policy for `kind`.
    pub fn policy(&self, kind: ErrorKind) -> RetryPolicy {
        self.policies
            .read()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_else(RetryPolicy::never)
    }

    /// Delay to wait before retry number `attempt` (0-based).
    pub fn next_delay(&self, kind: ErrorKind, attempt: u32) -> Duration {
        self.policy(kind).delay_for_attempt(attempt)
    }

    /// Whether retry number `attempt` (0-based) of `err` should happen.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32, err: &Error) -> bool {
        self.policy(kind).allows(attempt, err)
    }
}

impl Default for RetryPolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retry_policy_delay_calculation() {
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_millis(1000))
            .with_jitter(true);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_api_404_never_retried() {
        let engine = RetryPolicyEngine::new();
        let not_found = Error::api(404, "no such mission");

        assert!(!engine.should_retry(ErrorKind::Api, 0, &not_found));
    }

    #[test]
    fn test_api_5xx_retried_until_ceiling() {
        let engine = RetryPolicyEngine::new();
        let unavailable = Error::api(503, "maintenance");

        assert!(engine.should_retry(ErrorKind::Api, 0, &unavailable));
        assert!(engine.should_retry(ErrorKind::Api, 1, &unavailable));
        assert!(!engine.should_retry(ErrorKind::Api, 2, &unavailable));
    }

    #[test]
    fn test_network_policy_retries_connection_failures_only() {
        let engine = RetryPolicyEngine::new();

        assert!(engine.should_retry(ErrorKind::Network, 0, &Error::Network("reset".into())));
        assert!(!engine.should_retry(ErrorKind::Network, 0, &Error::Validation("bad".into())));
    }

    #[test]
    fn test_non_retryable_kinds() {
        let engine = RetryPolicyEngine::new();
        let err = Error::Auth("expired".into());

        for kind in [ErrorKind::Validation, ErrorKind::Auth, ErrorKind::Permission] {
            assert!(!engine.should_retry(kind, 0, &err));
        }
    }

    #[test]
    fn test_register_replaces_policy() {
        let engine = RetryPolicyEngine::new();
        engine.register(ErrorKind::Validation, RetryPolicy::immediate(1));

        let err = Error::Validation("x".into());
        assert!(engine.should_retry(ErrorKind::Validation, 0, &err));
        assert_eq!(engine.next_delay(ErrorKind::Validation, 0), Duration::ZERO);
    }

    #[test]
    fn test_custom_condition() {
        let policy = RetryPolicy::new(5).with_condition(RetryCondition::Custom(Arc::new(|err| {
            matches!(err, Error::Api { status: 429, .. })
        })));

        assert!(policy.allows(0, &Error::api(429, "slow down")));
        assert!(!policy.allows(0, &Error::api(500, "boom")));
    }

    #[test]
    fn test_uniform_engine() {
        let engine = RetryPolicyEngine::uniform(RetryPolicy::immediate(2));
        for kind in ErrorKind::ALL {
            assert_eq!(engine.policy(kind).max_retries, 2);
            assert_eq!(engine.next_delay(kind, 1), Duration::ZERO);
        }
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_capped(
            base_ms in 0u64..5_000,
            max_ms in 0u64..120_000,
            multiplier in 1.0f64..4.0,
            max_retries in 1u32..16,
        ) {
            let policy = RetryPolicy::new(max_retries)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_backoff_multiplier(multiplier);
            let cap = Duration::from_millis(max_ms);

            for attempt in 0..max_retries {
                let current = policy.delay_for_attempt(attempt);
                let next = policy.delay_for_attempt(attempt + 1);
                prop_assert!(next >= current);
                prop_assert!(next <= cap);
            }
        }
    }
}
