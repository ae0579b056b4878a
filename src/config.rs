//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::event_sourcing::ManagerConfig;
use crate::messaging::{BusConfig, ConsumerConfig, PublisherConfig};
use crate::projection::RefreshConfig;
use crate::utils::RetryConfig;

/// Runtime configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Topic exchange events are published to.
    pub exchange: String,

    /// First segment of every routing key.
    pub routing_key_prefix: String,

    /// Workers per consumer subscription.
    pub consumer_concurrency: usize,

    /// Publisher resends after the first attempt.
    pub max_resends: u32,

    /// Fixed delay between resends.
    pub resend_delay: Duration,

    /// Deadline for a single publish.
    pub publish_timeout: Duration,

    /// Total backoff budget when reconnecting to the broker.
    pub reconnect_max_elapsed: Duration,

    /// Projection refresh interval.
    pub refresh_interval: Duration,

    /// History replays allowed per outdated event.
    pub max_catch_up_attempts: u32,

    /// Reload-and-retry rounds on an optimistic-concurrency conflict.
    pub max_conflict_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: "cluster.events".to_string(),
            routing_key_prefix: "events".to_string(),
            consumer_concurrency: 4,
            max_resends: 3,
            resend_delay: Duration::from_millis(250),
            publish_timeout: Duration::from_millis(10_000),
            reconnect_max_elapsed: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(30),
            max_catch_up_attempts: 3,
            max_conflict_retries: 3,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let exchange = lookup("CQRS_EXCHANGE").unwrap_or(defaults.exchange);
        let routing_key_prefix = lookup("CQRS_ROUTING_KEY_PREFIX").unwrap_or(defaults.routing_key_prefix);
        anyhow::ensure!(!exchange.is_empty(), "CQRS_EXCHANGE cannot be empty.");
        anyhow::ensure!(
            !routing_key_prefix.is_empty() && !routing_key_prefix.contains(['*', '#']),
            "CQRS_ROUTING_KEY_PREFIX must be non-empty and free of wildcards."
        );

        let consumer_concurrency: usize = parse(&lookup, "CQRS_CONSUMER_CONCURRENCY")?
            .unwrap_or(defaults.consumer_concurrency)
            .max(1);

        let max_resends = parse(&lookup, "CQRS_MAX_RESENDS")?.unwrap_or(defaults.max_resends);

        let resend_delay = parse(&lookup, "CQRS_RESEND_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.resend_delay);

        let publish_timeout = parse(&lookup, "CQRS_PUBLISH_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.publish_timeout);

        let reconnect_max_elapsed = parse(&lookup, "CQRS_RECONNECT_MAX_ELAPSED_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconnect_max_elapsed);

        let refresh_interval = parse(&lookup, "CQRS_REFRESH_INTERVAL_SECS")?
            .map(|secs: u64| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.refresh_interval);

        let max_catch_up_attempts =
            parse(&lookup, "CQRS_MAX_CATCH_UP_ATTEMPTS")?.unwrap_or(defaults.max_catch_up_attempts);

        let max_conflict_retries =
            parse(&lookup, "CQRS_MAX_CONFLICT_RETRIES")?.unwrap_or(defaults.max_conflict_retries);

        Ok(Self {
            exchange,
            routing_key_prefix,
            consumer_concurrency,
            max_resends,
            resend_delay,
            publish_timeout,
            reconnect_max_elapsed,
            refresh_interval,
            max_catch_up_attempts,
            max_conflict_retries,
        })
    }

    pub fn bus(&self) -> BusConfig {
        BusConfig {
            publisher: PublisherConfig {
                exchange: self.exchange.clone(),
                routing_key_prefix: self.routing_key_prefix.clone(),
                max_resends: self.max_resends,
                resend_delay: self.resend_delay,
                publish_timeout: self.publish_timeout,
                ..PublisherConfig::default()
            },
            consumer: ConsumerConfig {
                exchange: self.exchange.clone(),
                routing_key_prefix: self.routing_key_prefix.clone(),
                concurrency: self.consumer_concurrency,
                ..ConsumerConfig::default()
            },
            reconnect: RetryConfig::reconnect(self.reconnect_max_elapsed),
        }
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            max_conflict_retries: self.max_conflict_retries,
        }
    }

    pub fn refresh(&self) -> RefreshConfig {
        RefreshConfig {
            interval: self.refresh_interval,
            ..RefreshConfig::default()
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} must be a non-negative integer."))
}
