//! Retry strategies and backoff policies for magpie's transfer agents.
//!
//! This crate provides configurable retry behaviour for the upload agent:
//! - Multiple backoff strategies (immediate, exponential, linear, constant)
//! - Jitter to avoid synchronised retries across hosts
//! - Policy presets tuned for transfer workloads
//!
//! # Example
//!
//! ```
//! use magpie_retry::{TransferPolicy, calculate_delay};
//!
//! let config = TransferPolicy::Default.to_config();
//! let delay = calculate_delay(&config, 2);
//! assert!(delay <= config.max_delay);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay grows linearly each attempt.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Predefined retry policies for common destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPolicy {
    /// Balanced behaviour for ordinary collection servers.
    #[default]
    Default,
    /// Flaky links: more attempts, quicker first retry.
    Persistent,
    /// Interactive runs: fewer attempts, fail fast.
    Impatient,
    /// Fully custom configuration.
    Custom,
}

impl TransferPolicy {
    /// The retry configuration this policy stands for.
    pub fn to_config(&self) -> RetryConfig {
        match self {
            TransferPolicy::Default => RetryConfig {
                strategy: BackoffStrategy::Exponential,
                max_attempts: 5,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                jitter: 0.4,
            },
            TransferPolicy::Persistent => RetryConfig {
                strategy: BackoffStrategy::Exponential,
                max_attempts: 10,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
            TransferPolicy::Impatient => RetryConfig {
                strategy: BackoffStrategy::Constant,
                max_attempts: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(1),
                jitter: 0.0,
            },
            TransferPolicy::Custom => RetryConfig::default(),
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Strategy for calculating the delay between attempts.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on the computed delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor, `0.0` (none) to `1.0` (up to the full delay shaved).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: 0.0,
        }
    }
}

/// Delay before retry number `attempt` (1-based: attempt 1 is the first
/// retry). Jitter subtracts a random share of the computed delay so
/// concurrent agents spread out.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let raw = match config.strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Constant => config.base_delay,
        BackoffStrategy::Linear => config.base_delay.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            let shift = attempt.saturating_sub(1).min(31);
            config.base_delay.saturating_mul(1u32 << shift)
        }
    };
    let capped = raw.min(config.max_delay);

    if config.jitter <= 0.0 || capped.is_zero() {
        return capped;
    }
    let jitter = config.jitter.clamp(0.0, 1.0);
    let factor = 1.0 - jitter * rand::random::<f64>();
    capped.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig {
            strategy,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let config = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(8));
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(30));
    }

    #[test]
    fn linear_grows_by_base() {
        let config = no_jitter(BackoffStrategy::Linear);
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(6));
    }

    #[test]
    fn constant_and_immediate() {
        let constant = no_jitter(BackoffStrategy::Constant);
        assert_eq!(calculate_delay(&constant, 7), Duration::from_secs(2));

        let immediate = no_jitter(BackoffStrategy::Immediate);
        assert_eq!(calculate_delay(&immediate, 3), Duration::ZERO);
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let config = RetryConfig {
            jitter: 0.8,
            ..no_jitter(BackoffStrategy::Exponential)
        };
        for attempt in 1..20 {
            let d = calculate_delay(&config, attempt);
            assert!(d <= config.max_delay);
        }
    }

    #[test]
    fn presets_are_sane() {
        for policy in [
            TransferPolicy::Default,
            TransferPolicy::Persistent,
            TransferPolicy::Impatient,
            TransferPolicy::Custom,
        ] {
            let config = policy.to_config();
            assert!(config.max_attempts >= 1);
            assert!(config.base_delay <= config.max_delay);
            assert!((0.0..=1.0).contains(&config.jitter));
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let config = no_jitter(BackoffStrategy::Exponential);
        let d = calculate_delay(&config, u32::MAX);
        assert_eq!(d, config.max_delay);
    }

    proptest::proptest! {
        #[test]
        fn delay_is_always_within_the_cap(
            attempt in 1u32..10_000,
            base_ms in 1u64..10_000,
            jitter in 0.0f64..1.0,
        ) {
            let config = RetryConfig {
                strategy: BackoffStrategy::Exponential,
                max_attempts: 10,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_secs(60),
                jitter,
            };
            proptest::prop_assert!(calculate_delay(&config, attempt) <= config.max_delay);
        }
    }

    #[test]
    fn config_deserializes_human_durations() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"strategy":"linear","base_delay":"500ms","max_delay":"10s"}"#)
                .expect("deserialize");
        assert_eq!(config.strategy, BackoffStrategy::Linear);
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(10));
    }
}
