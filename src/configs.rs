// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Service Configuration
//!
//! Environment-driven configuration for the broker connection and the consumer
//! fan-out. Values are read from the process environment after loading an optional
//! `.env` file; every key has a default except the action and channel lists.

use std::{env, time::Duration};
use thiserror::Error;

pub const DEFAULT_APP_NAME: &str = "ussd-queue";
/// Reconnection attempts allowed when `rabbitmq_max_retries` is unset.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RESUBSCRIBE_DELAY_SECS: u64 = 5;

/// Errors raised while reading configuration values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfigs {
    pub name: String,
}

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub vhost: String,
    /// Upper bound of reconnection attempts before giving up.
    pub max_retries: u32,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            port: 5672,
            vhost: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Consumer fan-out and delivery policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfigs {
    pub actions: Vec<String>,
    pub channels: Vec<String>,
    /// When non-empty, the router strips the first dot segment of a queue name.
    pub queue_prefix: String,
    pub resubscribe_delay: Duration,
    /// `None` keeps failed messages requeued forever.
    pub max_redeliveries: Option<u32>,
}

impl Default for ConsumerConfigs {
    fn default() -> Self {
        ConsumerConfigs {
            actions: vec![],
            channels: vec![],
            queue_prefix: String::new(),
            resubscribe_delay: Duration::from_secs(DEFAULT_RESUBSCRIBE_DELAY_SECS),
            max_redeliveries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub consumer: ConsumerConfigs,
}

impl Configs {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn from_env() -> Result<Configs, ConfigError> {
        dotenv::dotenv().ok();
        Configs::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Configs, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let rabbitmq_defaults = RabbitMQConfigs::default();

        let rabbitmq = RabbitMQConfigs {
            host: get("rabbitmq_host").unwrap_or(rabbitmq_defaults.host),
            user: get("rabbitmq_user").unwrap_or(rabbitmq_defaults.user),
            password: get("rabbitmq_pass").unwrap_or(rabbitmq_defaults.password),
            port: parse(&get, "rabbitmq_port")?.unwrap_or(rabbitmq_defaults.port),
            vhost: get("rabbitmq_vhost").unwrap_or_default(),
            max_retries: parse(&get, "rabbitmq_max_retries")?
                .unwrap_or(rabbitmq_defaults.max_retries),
        };

        let consumer = ConsumerConfigs {
            actions: split_list(get("queues")),
            channels: split_list(get("channels")),
            queue_prefix: get("queue_prefix").unwrap_or_default(),
            resubscribe_delay: Duration::from_secs(
                parse(&get, "consumer_resubscribe_delay_secs")?
                    .unwrap_or(DEFAULT_RESUBSCRIBE_DELAY_SECS),
            ),
            max_redeliveries: parse(&get, "consumer_max_redeliveries")?,
        };

        Ok(Configs {
            app: AppConfigs {
                name: get("app_name").unwrap_or_else(|| DEFAULT_APP_NAME.to_owned()),
            },
            rabbitmq,
            consumer,
        })
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_owned(),
                value,
            }),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|v| {
        v.split(',')
            .map(|item| item.trim().to_owned())
            .filter(|item| !item.is_empty())
            .collect()
    })
    .unwrap_or_default()
}
