// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Builds the broker URI and keeps the named channels multiplexed over the
//! current connection. The registry itself is owned by
//! [`RabbitMQClient`](crate::client::RabbitMQClient) and lives under the same lock
//! as the connection, so a registry entry always belongs to the live connection.

use crate::configs::RabbitMQConfigs;
use lapin::Channel;
use std::{collections::HashMap, sync::Arc};

/// Channel reserved for publishing.
pub const PUBLISHER_CHANNEL: &str = "publisher";
/// Channel reserved for consuming.
pub const CONSUMER_CHANNEL: &str = "consumer";

/// Channels opened eagerly on every (re)connection.
pub const EAGER_CHANNELS: [&str; 2] = [PUBLISHER_CHANNEL, CONSUMER_CHANNEL];

/// Builds the `amqp://` URI for the configured broker.
///
/// An empty vhost yields a trailing `/`, which selects the broker default vhost.
pub fn amqp_uri(cfg: &RabbitMQConfigs) -> String {
    format!(
        "amqp://{}:{}@{}:{}/{}",
        cfg.user, cfg.password, cfg.host, cfg.port, cfg.vhost
    )
}

/// Same as [`amqp_uri`] with the password masked, for logs.
pub fn redacted_uri(cfg: &RabbitMQConfigs) -> String {
    format!(
        "amqp://{}:***@{}:{}/{}",
        cfg.user, cfg.host, cfg.port, cfg.vhost
    )
}

/// Named channels of one connection.
///
/// A closed channel is never repaired; the whole registry is cleared when the
/// connection is replaced.
#[derive(Debug)]
pub struct ChannelRegistry<C = Channel> {
    channels: HashMap<String, Arc<C>>,
}

impl<C> Default for ChannelRegistry<C> {
    fn default() -> Self {
        ChannelRegistry {
            channels: HashMap::default(),
        }
    }
}

impl<C> ChannelRegistry<C> {
    /// Stores `channel` under `name`, returning the channel it replaced.
    pub fn insert(&mut self, name: &str, channel: C) -> Option<Arc<C>> {
        self.channels.insert(name.to_owned(), Arc::new(channel))
    }

    /// Looks up the channel registered under `name`.
    ///
    /// # Returns
    /// A shared handle to the channel, or `None` when nothing is registered under
    /// that name for the current connection
    pub fn get(&self, name: &str) -> Option<Arc<C>> {
        self.channels.get(name).cloned()
    }

    /// Drops every channel; used when the owning connection goes away.
    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
