//! Environment-driven tuning for the consumption pipeline.

use std::str::FromStr;
use std::time::Duration;

/// Tuning knobs for subscription processors.
///
/// `Default` reads the environment so a plain `CoreConfig::default()` picks
/// up deployment settings; construct the struct directly to override in
/// code.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Capacity of the bounded work queue between listener and dispatcher.
    pub queue_capacity: usize,
    /// Maximum number of concurrently executing handler invocations.
    pub max_dop: usize,
    /// When true the dispatcher reads work in batches of up to `max_dop`.
    pub batching: bool,
    /// Idle window after which a partially filled batch is dispatched.
    pub batch_idle: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: env_or("NATS_SUBSCRIPTION_QUEUE_SIZE", 20_000),
            max_dop: env_or("NATS_CONSUMER_MAX_DOP", 128),
            batching: true,
            batch_idle: Duration::from_millis(25),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_when_env_unset() {
        std::env::remove_var("NATS_SUBSCRIPTION_QUEUE_SIZE");
        std::env::remove_var("NATS_CONSUMER_MAX_DOP");

        let config = CoreConfig::default();
        assert_eq!(config.queue_capacity, 20_000);
        assert_eq!(config.max_dop, 128);
        assert!(config.batching);
    }

    #[test]
    #[serial]
    fn env_overrides_defaults() {
        std::env::set_var("NATS_SUBSCRIPTION_QUEUE_SIZE", "64");
        std::env::set_var("NATS_CONSUMER_MAX_DOP", "4");

        let config = CoreConfig::default();
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.max_dop, 4);

        std::env::remove_var("NATS_SUBSCRIPTION_QUEUE_SIZE");
        std::env::remove_var("NATS_CONSUMER_MAX_DOP");
    }

    #[test]
    #[serial]
    fn garbage_env_falls_back_to_default() {
        std::env::set_var("NATS_CONSUMER_MAX_DOP", "not-a-number");
        let config = CoreConfig::default();
        assert_eq!(config.max_dop, 128);
        std::env::remove_var("NATS_CONSUMER_MAX_DOP");
    }
}
