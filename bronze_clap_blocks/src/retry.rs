//! Retry policy of calls to external systems and of consumer restarts.

use std::time::Duration;

use bronze_backoff::BackoffConfig;

/// CLI config for backoff, restart cooldown and receive timeouts.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct RetryConfig {
    /// Delay before the first retry of a failed call.
    #[clap(
        long = "retry-initial-backoff",
        env = "BRONZE_RETRY_INITIAL_BACKOFF",
        default_value = "100ms",
        value_parser = humantime::parse_duration,
        action
    )]
    pub initial_backoff: Duration,

    /// Upper bound of a single retry delay.
    #[clap(
        long = "retry-max-backoff",
        env = "BRONZE_RETRY_MAX_BACKOFF",
        default_value = "10s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub max_backoff: Duration,

    /// Growth factor of the retry delay.
    #[clap(
        long = "retry-backoff-base",
        env = "BRONZE_RETRY_BACKOFF_BASE",
        default_value = "3",
        action
    )]
    pub base: f64,

    /// Attempts per call, including the first one.
    #[clap(
        long = "retry-max-attempts",
        env = "BRONZE_RETRY_MAX_ATTEMPTS",
        default_value = "8",
        action
    )]
    pub max_attempts: u32,

    /// Deadline of a single attempt. An expired attempt counts as a transient failure.
    #[clap(
        long = "retry-attempt-timeout",
        env = "BRONZE_RETRY_ATTEMPT_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub attempt_timeout: Duration,

    /// Cooldown before the first restart of a failed consumer task. Grows with every
    /// consecutive failure up to `--restart-max-cooldown`.
    #[clap(
        long = "restart-cooldown",
        env = "BRONZE_RESTART_COOLDOWN",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub restart_cooldown: Duration,

    /// Upper bound of the consumer restart cooldown.
    #[clap(
        long = "restart-max-cooldown",
        env = "BRONZE_RESTART_MAX_COOLDOWN",
        default_value = "5m",
        value_parser = humantime::parse_duration,
        action
    )]
    pub restart_max_cooldown: Duration,

    /// How long a consumer waits for the next event before refreshing its lag gauge.
    #[clap(
        long = "receive-timeout",
        env = "BRONZE_RECEIVE_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub receive_timeout: Duration,
}

impl RetryConfig {
    /// Backoff of individual calls to channels, stores and source databases.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            init_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            base: self.base,
            max_attempts: self.max_attempts,
            attempt_timeout: self.attempt_timeout,
        }
    }

    /// Cooldown between restarts of a failed consumer task. Restarts are never exhausted.
    pub fn restart_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            init_backoff: self.restart_cooldown,
            max_backoff: self.restart_max_cooldown,
            base: self.base,
            max_attempts: u32::MAX,
            attempt_timeout: self.attempt_timeout,
        }
    }
}
