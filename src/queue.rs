// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions for RabbitMQ
//!
//! This module provides the types used to declare and bind queues. It also
//! knows how a primary queue's dead-letter counterpart (`<queue>-dlx`) is
//! derived: same declaration flags, minus every dead-lettering argument.

use crate::message::{HeaderValue, Headers};

/// Argument naming the dead letter exchange of a queue
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Argument naming the dead letter routing key of a queue
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Argument limiting redeliveries on quorum queues
pub const AMQP_HEADERS_DELIVERY_LIMIT: &str = "x-delivery-limit";
/// Argument selecting the queue implementation
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Argument selecting the mirroring policy
pub const AMQP_HEADERS_HA_POLICY: &str = "x-ha-policy";

/// Suffix of the queue collecting dead-lettered messages
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = "-dlx";

/// Arguments a dead-letter queue must never carry itself.
const DEAD_LETTER_ARGUMENTS: [&str; 3] = [
    AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
    AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
    AMQP_HEADERS_DELIVERY_LIMIT,
];

/// Definition of a RabbitMQ queue with its declaration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Headers,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition with the given name.
    ///
    /// An empty name asks the broker to generate one.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Private reply queue used by request/response calls: server-named,
    /// exclusive, auto-deleted, non-durable and classic.
    pub fn reply_queue() -> QueueDefinition {
        let mut arguments = Headers::new();
        arguments.insert(AMQP_HEADERS_HA_POLICY.to_owned(), HeaderValue::from("all"));
        arguments.insert(AMQP_HEADERS_QUEUE_TYPE.to_owned(), HeaderValue::from("classic"));

        QueueDefinition::new("")
            .exclusive(true)
            .auto_delete(true)
            .arguments(arguments)
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Makes the declaration passive, checking for existence without creating it.
    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    /// Sets the declaration arguments.
    pub fn arguments(mut self, arguments: Headers) -> Self {
        self.arguments = arguments;
        self
    }

    /// Builds the `<queue>-dlx` counterpart for the given (declared) queue name.
    pub fn dead_letter_counterpart(&self, queue_name: &str) -> QueueDefinition {
        let mut arguments = self.arguments.clone();
        for key in DEAD_LETTER_ARGUMENTS {
            arguments.remove(key);
        }

        QueueDefinition {
            name: format!("{}{}", queue_name, DEAD_LETTER_QUEUE_SUFFIX),
            arguments,
            ..self.clone()
        }
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Binds a queue to an exchange with a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_lettered() -> QueueDefinition {
        let mut arguments = Headers::new();
        arguments.insert(AMQP_HEADERS_QUEUE_TYPE.into(), "quorum".into());
        arguments.insert(AMQP_HEADERS_DEAD_LETTER_EXCHANGE.into(), "jobs.dead".into());
        arguments.insert(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.into(), "jobs".into());
        arguments.insert(AMQP_HEADERS_DELIVERY_LIMIT.into(), HeaderValue::Int(5));

        QueueDefinition::new("jobs").durable(true).arguments(arguments)
    }

    #[test]
    fn counterpart_drops_dead_letter_arguments() {
        let dlq = dead_lettered().dead_letter_counterpart("jobs");

        assert_eq!(dlq.name, "jobs-dlx");
        assert!(dlq.durable);
        assert!(!dlq.arguments.contains_key(AMQP_HEADERS_DEAD_LETTER_EXCHANGE));
        assert!(!dlq.arguments.contains_key(AMQP_HEADERS_DELIVERY_LIMIT));
        assert!(!dlq.arguments.contains_key(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY));
        assert_eq!(dlq.arguments[AMQP_HEADERS_QUEUE_TYPE], HeaderValue::from("quorum"));
    }

    #[test]
    fn reply_queue_is_private_and_transient() {
        let def = QueueDefinition::reply_queue();

        assert!(def.name.is_empty());
        assert!(def.exclusive);
        assert!(def.auto_delete);
        assert!(!def.durable);
        assert_eq!(def.arguments[AMQP_HEADERS_QUEUE_TYPE], HeaderValue::from("classic"));
    }
}
