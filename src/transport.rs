// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The channel layer never talks to the wire directly. It opens a [`Session`]
//! (one connection plus one protocol channel) through a [`Transport`] and
//! issues broker RPCs on it. The production implementation lives in
//! [`crate::broker`]; tests substitute scripted sessions.

use crate::{
    config::ChannelProperties,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Message},
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
};
use async_trait::async_trait;
use std::time::Duration;

/// Quality-of-service limits applied before consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosDefinition {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

/// Parameters of a `basic.consume` registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub queue: String,
    pub tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Opens sessions against a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection and protocol channel.
    async fn connect(&self, properties: &ChannelProperties) -> Result<Box<dyn Session>, AmqpError>;
}

/// A live connection/channel pair. Exclusively owned; discarded after a fault.
#[async_trait]
pub trait Session: Send {
    /// Declares an exchange.
    ///
    /// # Parameters
    /// * `def` - Name, kind, flags and arguments of the exchange
    async fn exchange_declare(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue.
    ///
    /// # Parameters
    /// * `def` - Queue definition; an empty name asks the broker for one
    ///
    /// # Returns
    /// The declared queue with the name the broker settled on.
    async fn queue_declare(&mut self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError>;

    /// Binds a queue to an exchange.
    async fn queue_bind(&mut self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Deletes a queue, dropping any messages left in it.
    async fn queue_delete(&mut self, queue: &str) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries on this channel.
    async fn basic_qos(&mut self, qos: &QosDefinition) -> Result<(), AmqpError>;

    /// Publishes `message` to `exchange` with `routing_key`.
    ///
    /// An empty `exchange` is the default exchange, which routes straight to
    /// the queue named by `routing_key`.
    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), AmqpError>;

    /// Registers a consumer. Its deliveries are returned by [`wait`](Session::wait).
    async fn basic_consume(&mut self, def: &ConsumerDefinition) -> Result<(), AmqpError>;

    /// Cancels the consumer registered under `consumer_tag`.
    async fn basic_cancel(&mut self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Acknowledges the delivery carrying `delivery_tag`.
    ///
    /// Delivery tags are only valid on the session that received them.
    async fn basic_ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects the delivery carrying `delivery_tag`, requeueing it when
    /// `requeue` is set.
    async fn basic_reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Waits for the next delivery on any registered consumer.
    ///
    /// Returns `Ok(None)` once `timeout` elapses, or immediately when no
    /// consumer is registered. A `None` timeout waits indefinitely.
    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>, AmqpError>;

    /// Reports whether any consumer is registered on this session.
    fn is_consuming(&self) -> bool;

    /// Closes the channel and then the connection.
    async fn close(&mut self) -> Result<(), AmqpError>;
}
