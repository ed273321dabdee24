// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Channel Layer
//!
//! This module provides the error type shared by every operation of the channel
//! layer. The `AmqpError` enum separates faults the layer can heal on its own
//! (a dropped channel, a missed heartbeat) from faults it reports to the caller
//! (bad configuration, broker refusals, failed connection attempts).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Only `ChannelFault` is considered recoverable by reconnecting. A
/// `ProtocolFault` raised while consuming forces the consumer to restart, but
/// it is not retried anywhere else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// The channel properties are missing a required field or carry an invalid value
    #[error("invalid channel properties: {0}")]
    InvalidProperties(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Heartbeat missed, channel or connection closed mid-operation
    #[error("channel fault: {0}")]
    ChannelFault(String),

    /// Protocol violation reported by the broker
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),
}

impl AmqpError {
    /// Reports whether the fault can be healed by replacing the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AmqpError::ChannelFault(_))
    }

    /// Reports whether the broker rejected an operation on protocol grounds.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, AmqpError::ProtocolFault(_))
    }

    /// Faults that make a running consumer start over on a fresh connection.
    pub(crate) fn restarts_consumer(&self) -> bool {
        self.is_recoverable() || self.is_protocol_fault()
    }
}
