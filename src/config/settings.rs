use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::manager::retry::RetryPolicy;

/// Top-level configuration settings for the application.
///
/// Includes the broker to talk to, client-side tuning, retry policy and
/// logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub client: ClientSettings,
    pub retry: RetrySettings,
    pub logging: LoggingSettings,
}

/// Which broker to connect to and as whom.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub address: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_start: bool,
}

/// Timeouts and resources used by the client side of the connection.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub channel_capacity: usize,
    /// Directory for the unacknowledged-message spool; none disables it.
    pub spool_dir: Option<String>,
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Backoff for `ConnectionManager::connect_with_retry`.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub client: Option<PartialClientSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub address: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_start: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub connect_timeout_ms: Option<u64>,
    pub operation_timeout_ms: Option<u64>,
    pub keep_alive_secs: Option<u64>,
    pub channel_capacity: Option<usize>,
    pub spool_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRetrySettings {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let client = self.client.unwrap_or_default();
        let retry = self.retry.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                address: broker.address.unwrap_or(default.broker.address),
                client_id: broker.client_id.unwrap_or(default.broker.client_id),
                username: broker.username.or(default.broker.username),
                password: broker.password.or(default.broker.password),
                clean_start: broker.clean_start.unwrap_or(default.broker.clean_start),
            },
            client: ClientSettings {
                connect_timeout_ms: client
                    .connect_timeout_ms
                    .unwrap_or(default.client.connect_timeout_ms),
                operation_timeout_ms: client
                    .operation_timeout_ms
                    .unwrap_or(default.client.operation_timeout_ms),
                keep_alive_secs: client
                    .keep_alive_secs
                    .unwrap_or(default.client.keep_alive_secs),
                channel_capacity: client
                    .channel_capacity
                    .unwrap_or(default.client.channel_capacity),
                spool_dir: client.spool_dir.or(default.client.spool_dir),
            },
            retry: RetrySettings {
                max_attempts: retry.max_attempts.unwrap_or(default.retry.max_attempts),
                initial_delay_ms: retry
                    .initial_delay_ms
                    .unwrap_or(default.retry.initial_delay_ms),
                max_delay_ms: retry.max_delay_ms.unwrap_or(default.retry.max_delay_ms),
                multiplier: retry.multiplier.unwrap_or(default.retry.multiplier),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                address: "tcp://127.0.0.1:1883".to_string(),
                client_id: format!("client-{}", Uuid::new_v4().simple()),
                username: None,
                password: None,
                clean_start: true,
            },
            client: ClientSettings::default(),
            retry: RetrySettings {
                max_attempts: 5,
                initial_delay_ms: 1000,
                max_delay_ms: 60_000,
                multiplier: 1.1,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            operation_timeout_ms: 30_000,
            keep_alive_secs: 60,
            channel_capacity: 64,
            spool_dir: None,
        }
    }
}
