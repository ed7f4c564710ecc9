//! Process configuration, read from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | required |
//! | `KAFKA_BROKERS` | `localhost:9092` |
//! | `COMMAND_SUBJECT` | `create-accommodation.command` |
//! | `REPLY_SUBJECT` | `create-accommodation.reply` |
//! | `SERVICE_GROUP` | `accommodations-service` |
//! | `PARTICIPANT_GROUP` | `reservations-service` |
//! | `SUBSCRIPTION_GROUP` | `metrics-query` |
//! | `SAGA_REPLY_TIMEOUT_SECS` | `30` |
//! | `RECONNECT_INITIAL_DELAY_MS` | `100` |
//! | `RECONNECT_MAX_DELAY_MS` | `30000` |
//! | `SUBSCRIPTION_POLL_INTERVAL_MS` | `200` |
//! | `METRICS_ADDR` | unset (no exporter) |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A variable is set but unusable
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Everything the process needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Postgres connection string for the event store and subscriptions
    pub database_url: String,
    /// Comma-separated Kafka/Redpanda brokers
    pub kafka_brokers: String,
    /// Subject saga commands travel on
    pub command_subject: String,
    /// Subject saga replies travel on
    pub reply_subject: String,
    /// Queue group of the accommodations side
    pub service_group: String,
    /// Queue group of the availability participant
    pub participant_group: String,
    /// Consumer group of the metrics projection
    pub subscription_group: String,
    /// How long a saga waits for the participant
    pub saga_reply_timeout: Duration,
    /// First reconnect delay of the projection consumer
    pub reconnect_initial_delay: Duration,
    /// Reconnect delay cap of the projection consumer
    pub reconnect_max_delay: Duration,
    /// Pause between subscription polls
    pub subscription_poll_interval: Duration,
    /// Prometheus listener, if any
    pub metrics_addr: Option<SocketAddr>,
}

impl ServiceConfig {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `DATABASE_URL` is missing or any value is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `DATABASE_URL` is missing or any value is malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let reconnect_initial_delay =
            Duration::from_millis(env.parsed("RECONNECT_INITIAL_DELAY_MS", 100)?);
        let reconnect_max_delay = Duration::from_millis(env.parsed("RECONNECT_MAX_DELAY_MS", 30_000)?);
        if reconnect_max_delay < reconnect_initial_delay {
            return Err(ConfigError::Invalid {
                name: "RECONNECT_MAX_DELAY_MS",
                value: reconnect_max_delay.as_millis().to_string(),
                reason: "must not be below RECONNECT_INITIAL_DELAY_MS".to_string(),
            });
        }

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            kafka_brokers: env.text("KAFKA_BROKERS", "localhost:9092"),
            command_subject: env.text("COMMAND_SUBJECT", "create-accommodation.command"),
            reply_subject: env.text("REPLY_SUBJECT", "create-accommodation.reply"),
            service_group: env.text("SERVICE_GROUP", "accommodations-service"),
            participant_group: env.text("PARTICIPANT_GROUP", "reservations-service"),
            subscription_group: env.text("SUBSCRIPTION_GROUP", "metrics-query"),
            saga_reply_timeout: Duration::from_secs(env.positive("SAGA_REPLY_TIMEOUT_SECS", 30)?),
            reconnect_initial_delay,
            reconnect_max_delay,
            subscription_poll_interval: Duration::from_millis(
                env.positive("SUBSCRIPTION_POLL_INTERVAL_MS", 200)?,
            ),
            metrics_addr: env.optional("METRICS_ADDR")?,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn text(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn optional<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|value| {
                value.parse().map_err(|error: T::Err| ConfigError::Invalid {
                    name,
                    reason: error.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn parsed(&self, name: &'static str, default: u64) -> Result<u64, ConfigError> {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    fn positive(&self, name: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.parsed(name, default)? {
            0 => Err(ConfigError::Invalid {
                name,
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            value => Ok(value),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServiceConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/stayflow")]).unwrap();

        assert_eq!(config.kafka_brokers, "localhost:9092");
        assert_eq!(config.command_subject, "create-accommodation.command");
        assert_eq!(config.reply_subject, "create-accommodation.reply");
        assert_eq!(config.service_group, "accommodations-service");
        assert_eq!(config.participant_group, "reservations-service");
        assert_eq!(config.subscription_group, "metrics-query");
        assert_eq!(config.saga_reply_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_initial_delay, Duration::from_millis(100));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
        assert_eq!(config.subscription_poll_interval, Duration::from_millis(200));
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(config(&[]), Err(ConfigError::Missing("DATABASE_URL")));
        assert_eq!(
            config(&[("DATABASE_URL", "   ")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn overrides_are_read() {
        let config = config(&[
            ("DATABASE_URL", "postgres://db/stayflow"),
            ("KAFKA_BROKERS", "redpanda:9092"),
            ("SAGA_REPLY_TIMEOUT_SECS", "5"),
            ("METRICS_ADDR", "0.0.0.0:9000"),
        ])
        .unwrap();

        assert_eq!(config.kafka_brokers, "redpanda:9092");
        assert_eq!(config.saga_reply_timeout, Duration::from_secs(5));
        assert_eq!(config.metrics_addr, Some("0.0.0.0:9000".parse().unwrap()));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let error = config(&[
            ("DATABASE_URL", "postgres://db"),
            ("SUBSCRIPTION_POLL_INTERVAL_MS", "fast"),
        ])
        .unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid { name: "SUBSCRIPTION_POLL_INTERVAL_MS", .. }
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let error = config(&[("DATABASE_URL", "postgres://db"), ("SAGA_REPLY_TIMEOUT_SECS", "0")])
            .unwrap_err();
        assert!(error.to_string().contains("greater than zero"));
    }

    #[test]
    fn reconnect_cap_must_cover_initial_delay() {
        let error = config(&[
            ("DATABASE_URL", "postgres://db"),
            ("RECONNECT_INITIAL_DELAY_MS", "500"),
            ("RECONNECT_MAX_DELAY_MS", "100"),
        ])
        .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { name: "RECONNECT_MAX_DELAY_MS", .. }));
    }

    #[test]
    fn bad_metrics_addr_is_rejected() {
        let error = config(&[("DATABASE_URL", "postgres://db"), ("METRICS_ADDR", "nowhere")])
            .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { name: "METRICS_ADDR", .. }));
    }
}
