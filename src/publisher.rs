// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides the publishing side of [`AmqpChannel`]. A publish that
//! fails with a channel fault is retried on a fresh connection until the
//! configured `reconnect_attempts` budget is exhausted, which bounds the
//! number of attempts to the budget plus one. Any other failure is returned
//! immediately.
//!
//! Every published message carries a generated message id, a content type
//! and the current OpenTelemetry context in its headers.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    message::{Message, DEFAULT_CONTENT_TYPE},
    otel,
};
use tracing::{error, warn};
use uuid::Uuid;

impl AmqpChannel {
    /// Publishes `message` to the configured exchange with the routing key `route`.
    pub async fn publish(&mut self, route: &str, message: Message) -> Result<(), AmqpError> {
        let exchange = self.properties.exchange.clone();
        self.publish_to(&exchange, route, message).await
    }

    /// Publishes `body` as a persistent message.
    pub async fn publish_persistent(
        &mut self,
        route: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), AmqpError> {
        self.publish(route, Message::new(body).persistent()).await
    }

    pub(crate) async fn publish_to(
        &mut self,
        exchange: &str,
        route: &str,
        mut message: Message,
    ) -> Result<(), AmqpError> {
        stamp(&mut message);

        let mut remaining = i64::from(self.properties.reconnect_attempts);
        loop {
            let result = match self.connection.session() {
                Ok(session) => session.basic_publish(exchange, route, &message).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_recoverable() => {
                    remaining -= 1;
                    if remaining < 0 {
                        error!(
                            error = err.to_string(),
                            exchange, route, "error publishing message, retries exhausted"
                        );
                        return Err(err);
                    }

                    warn!(
                        error = err.to_string(),
                        attempts_left = remaining,
                        "error publishing message, reconnecting"
                    );
                    self.connection.reconnect(true).await?;
                }
                Err(err) => {
                    error!(error = err.to_string(), exchange, route, "error publishing message");
                    return Err(err);
                }
            }
        }
    }
}

fn stamp(message: &mut Message) {
    let props = &mut message.properties;

    if props.message_id.is_none() {
        props.message_id = Some(Uuid::new_v4().to_string());
    }

    if props.content_type.is_none() {
        props.content_type = Some(DEFAULT_CONTENT_TYPE.to_owned());
    }

    otel::inject_current(&mut props.headers);
}
