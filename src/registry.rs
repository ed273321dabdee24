// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Registry
//!
//! Memoizes channels by `exchange.queue` so callers configured for the same
//! exchange and queue share one connection. The registry is an ordinary value
//! owned by the application; nothing here is global.

use crate::{
    channel::AmqpChannel, config::ChannelProperties, errors::AmqpError, transport::Transport,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

/// A channel shared between callers.
pub type SharedChannel = Arc<Mutex<AmqpChannel>>;

/// Channels keyed by `exchange.queue`.
pub struct ChannelRegistry {
    transport: Arc<dyn Transport>,
    channels: Mutex<HashMap<String, SharedChannel>>,
}

impl ChannelRegistry {
    /// Creates an empty registry opening its channels through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> ChannelRegistry {
        ChannelRegistry {
            transport,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel memoized for these properties' key, connecting a
    /// new one on first use.
    pub async fn get_or_create(
        &self,
        properties: ChannelProperties,
    ) -> Result<SharedChannel, AmqpError> {
        let key = properties.registry_key();
        let mut channels = self.channels.lock().await;

        if let Some(channel) = channels.get(&key) {
            return Ok(channel.clone());
        }

        debug!(key = %key, "creating memoized channel");
        let channel = AmqpChannel::connect(self.transport.clone(), properties).await?;
        let channel = Arc::new(Mutex::new(channel));
        channels.insert(key, channel.clone());

        Ok(channel)
    }

    /// Connects a channel that is never memoized.
    pub async fn create_temporary(
        &self,
        properties: ChannelProperties,
    ) -> Result<AmqpChannel, AmqpError> {
        AmqpChannel::connect(self.transport.clone(), properties).await
    }

    /// Forgets the channel stored under `key` without closing it.
    pub async fn evict(&self, key: &str) -> Option<SharedChannel> {
        self.channels.lock().await.remove(key)
    }

    /// Forgets the channel stored under `key` and closes it.
    pub async fn disconnect(&self, key: &str) {
        if let Some(channel) = self.evict(key).await {
            channel.lock().await.disconnect().await;
        }
    }

    /// Number of memoized channels.
    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
