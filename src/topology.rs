// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Declaration
//!
//! This module declares the topology described by a channel's properties:
//! the primary exchange, the dead-letter exchange, the primary queue, its
//! `<queue>-dlx` counterpart and the bindings of both.
//!
//! Dead-letter resources exist if and only if the queue arguments name a
//! non-empty `x-dead-letter-exchange`. The dead-letter queue is declared with
//! the primary queue's flags but without any dead-lettering arguments, and
//! every binding of the primary queue is mirrored onto it against the
//! dead-letter exchange.

use crate::{
    config::ChannelProperties,
    errors::AmqpError,
    queue::{QueueBinding, QueueDescriptor},
    transport::Session,
};
use tracing::debug;

/// Declares the topology of one channel.
pub struct AmqpTopology<'tp> {
    properties: &'tp ChannelProperties,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(properties: &'tp ChannelProperties) -> AmqpTopology<'tp> {
        AmqpTopology { properties }
    }

    /// Declares the primary exchange (when named) and the dead-letter exchange
    /// (when dead-lettering is configured).
    pub async fn declare_exchange(&self, session: &mut dyn Session) -> Result<(), AmqpError> {
        let exchanges = self
            .properties
            .exchange_definition()
            .into_iter()
            .chain(self.properties.dead_letter_exchange_definition());

        for exchange in exchanges {
            debug!("creating exchange: {}", exchange.name);
            session.exchange_declare(&exchange).await?;
            debug!("exchange: {} was created", exchange.name);
        }

        Ok(())
    }

    /// Declares the primary queue, its dead-letter counterpart and the
    /// bindings, returning the primary queue's descriptor.
    pub async fn declare_queue(
        &self,
        session: &mut dyn Session,
    ) -> Result<QueueDescriptor, AmqpError> {
        let definition = self.properties.queue_definition();

        debug!("creating queue: {}", definition.name);
        let descriptor = session.queue_declare(&definition).await?;
        debug!("queue: {} was created", descriptor.name);

        let dead_letter = match self.properties.dead_letter_exchange() {
            Some(exchange) => {
                let dlq = definition.dead_letter_counterpart(&descriptor.name);
                debug!("creating dead letter queue: {}", dlq.name);
                session.queue_declare(&dlq).await?;
                Some((exchange, dlq.name))
            }
            None => None,
        };

        for binding in &self.properties.bindings {
            if binding.queue != self.properties.queue {
                continue;
            }

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                descriptor.name, self.properties.exchange, binding.routing
            );
            session
                .queue_bind(&QueueBinding::new(
                    &descriptor.name,
                    &self.properties.exchange,
                    &binding.routing,
                ))
                .await?;

            if let Some((exchange, dlq)) = &dead_letter {
                session
                    .queue_bind(&QueueBinding::new(dlq, exchange, &binding.routing))
                    .await?;
            }
        }

        Ok(descriptor)
    }
}
