// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module provides [`AmqpChannel`], the object every publish, consume and
//! request call goes through. It owns the connection lifecycle, the declared
//! queue and the cache of settlement decisions that could not reach the
//! broker.
//!
//! Publishing lives in [`crate::publisher`], consuming in [`crate::consumer`]
//! and request/response calls in [`crate::request`]; all of them are methods
//! on this type.

use crate::{
    broker::LapinTransport,
    config::ChannelProperties,
    connection::{ConnectionManager, ReconnectOutcome},
    errors::AmqpError,
    message::Delivery,
    queue::QueueDescriptor,
    redelivery::RedeliveryCache,
    topology::AmqpTopology,
    transport::Transport,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Prefix of generated consumer tags when none is configured.
pub const DEFAULT_CONSUMER_TAG_PREFIX: &str = "rabbitmq-channel-";

/// Body of the message that cancels the consumer once acknowledged.
pub const QUIT_SENTINEL: &[u8] = b"quit";

/// How an acknowledgement or rejection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The broker accepted the decision.
    Confirmed,
    /// The channel failed first. The channel was replaced and the decision
    /// is replayed when the message is redelivered (if configured as final).
    Deferred,
}

/// A single logical channel to RabbitMQ.
///
/// Callers need exclusive access; share it behind a mutex (see
/// [`crate::registry::ChannelRegistry`]).
pub struct AmqpChannel {
    pub(crate) properties: Arc<ChannelProperties>,
    pub(crate) connection: ConnectionManager,
    pub(crate) redelivery: RedeliveryCache,
    pub(crate) consumer_tag: String,
    pub(crate) consuming: bool,
    queue: Option<QueueDescriptor>,
}

impl AmqpChannel {
    /// Connects to the broker with `lapin` and declares the exchanges.
    pub async fn open(properties: ChannelProperties) -> Result<AmqpChannel, AmqpError> {
        AmqpChannel::connect(Arc::new(LapinTransport), properties).await
    }

    /// Validates the properties, connects through `transport` and declares
    /// the exchanges.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        properties: ChannelProperties,
    ) -> Result<AmqpChannel, AmqpError> {
        if let Err(err) = properties.validate() {
            error!(error = err.to_string(), "invalid channel properties");
            return Err(err);
        }

        let properties = Arc::new(properties);
        let consumer_tag = format!(
            "{}{}",
            properties
                .consumer_tag
                .as_deref()
                .unwrap_or(DEFAULT_CONSUMER_TAG_PREFIX),
            Uuid::new_v4().simple()
        );

        let mut connection = ConnectionManager::new(transport, properties.clone());
        if let Err(err) = connection.establish().await {
            error!(
                error = err.to_string(),
                endpoint = %properties.identifier(),
                "failure to open the channel"
            );
            connection.disconnect().await;
            return Err(err);
        }

        debug!(endpoint = %properties.identifier(), "channel opened");

        Ok(AmqpChannel {
            properties,
            connection,
            redelivery: RedeliveryCache::new(),
            consumer_tag,
            consuming: false,
            queue: None,
        })
    }

    /// Declares the queue, its dead-letter counterpart and the bindings.
    pub async fn declare_queue(&mut self) -> Result<QueueDescriptor, AmqpError> {
        let properties = self.properties.clone();
        let descriptor = AmqpTopology::new(&properties)
            .declare_queue(self.connection.session()?)
            .await?;

        self.queue = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// The last queue declared on this channel.
    pub fn queue(&self) -> Option<&QueueDescriptor> {
        self.queue.as_ref()
    }

    pub fn properties(&self) -> &ChannelProperties {
        &self.properties
    }

    /// Tag the consumer registers under: the configured prefix plus a random suffix.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Acknowledges `delivery`.
    ///
    /// A channel fault is not reported: the channel is replaced silently and
    /// the acknowledgement is remembered for the redelivered copy when
    /// `queue_acknowledge_is_final` is set. A delivery received on a session
    /// that has since been replaced is treated the same way, without a broker
    /// call. Acknowledging the `quit` sentinel cancels the consumer.
    pub async fn acknowledge(&mut self, delivery: &Delivery) -> Result<Settlement, AmqpError> {
        let settlement = if self.is_stale(delivery) {
            warn!(
                delivery_tag = delivery.delivery_tag,
                "delivery belongs to a replaced session, acknowledgement deferred"
            );
            self.defer_ack(delivery);
            Settlement::Deferred
        } else {
            let result = match self.connection.session() {
                Ok(session) => session.basic_ack(delivery.delivery_tag).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => Settlement::Confirmed,
                Err(err) if err.is_recoverable() => {
                    warn!(
                        error = err.to_string(),
                        delivery_tag = delivery.delivery_tag,
                        "acknowledgement was not confirmed"
                    );
                    self.defer_ack(delivery);
                    self.settle_reconnect().await?
                }
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    return Err(err);
                }
            }
        };

        if delivery.body() == QUIT_SENTINEL {
            self.cancel_consumer().await;
        }

        Ok(settlement)
    }

    /// Rejects `delivery`, with the same fault handling as [`acknowledge`].
    ///
    /// [`acknowledge`]: AmqpChannel::acknowledge
    pub async fn reject(
        &mut self,
        delivery: &Delivery,
        requeue: bool,
    ) -> Result<Settlement, AmqpError> {
        if self.is_stale(delivery) {
            warn!(
                delivery_tag = delivery.delivery_tag,
                requeue, "delivery belongs to a replaced session, rejection deferred"
            );
            self.defer_reject(delivery, requeue);
            return Ok(Settlement::Deferred);
        }

        let result = match self.connection.session() {
            Ok(session) => session.basic_reject(delivery.delivery_tag, requeue).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => Ok(Settlement::Confirmed),
            Err(err) if err.is_recoverable() => {
                warn!(
                    error = err.to_string(),
                    delivery_tag = delivery.delivery_tag,
                    requeue,
                    "rejection was not confirmed"
                );
                self.defer_reject(delivery, requeue);
                self.settle_reconnect().await
            }
            Err(err) => {
                error!(error = err.to_string(), "error whiling reject msg");
                Err(err)
            }
        }
    }

    /// Delivery tags are scoped to the session that issued them.
    fn is_stale(&self, delivery: &Delivery) -> bool {
        delivery.generation != 0 && delivery.generation != self.connection.generation()
    }

    fn defer_ack(&mut self, delivery: &Delivery) {
        if self.properties.queue_acknowledge_is_final {
            self.redelivery.remember_ack(delivery);
        }
    }

    fn defer_reject(&mut self, delivery: &Delivery, requeue: bool) {
        if self.properties.queue_reject_is_final {
            self.redelivery.remember_reject(delivery, requeue);
        }
    }

    async fn settle_reconnect(&mut self) -> Result<Settlement, AmqpError> {
        self.connection.reconnect(false).await?;
        Ok(Settlement::Deferred)
    }

    /// Stops the consumer registered by [`consume`](AmqpChannel::consume).
    pub async fn cancel_consumer(&mut self) {
        self.consuming = false;

        let tag = self.consumer_tag.clone();
        let Ok(session) = self.connection.session() else {
            return;
        };
        if !session.is_consuming() {
            return;
        }

        info!(consumer = %tag, "cancelling consumer");
        if let Err(err) = session.basic_cancel(&tag).await {
            warn!(error = err.to_string(), consumer = %tag, "error cancelling consumer");
        }
    }

    /// Replaces the connection and re-declares the exchanges.
    pub async fn reconnect(&mut self, intentional: bool) -> Result<ReconnectOutcome, AmqpError> {
        self.connection.reconnect(intentional).await
    }

    /// Closes the channel and the connection. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.consuming = false;
        self.connection.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        testing::{delivery, FakeBroker},
    };

    fn properties() -> ChannelProperties {
        let mut props = ChannelProperties::new("localhost", "jobs");
        props.exchange = "events".to_owned();
        props
    }

    #[tokio::test]
    async fn invalid_properties_fail_before_connecting() {
        let broker = FakeBroker::new();

        let result = AmqpChannel::connect(broker.transport(), ChannelProperties::new("", "jobs")).await;

        assert!(matches!(result, Err(AmqpError::InvalidProperties(_))));
        assert_eq!(broker.connects(), 0);
    }

    #[tokio::test]
    async fn connect_declares_exchanges_and_tags_consumer() {
        let broker = FakeBroker::new();
        let mut props = properties();
        props.consumer_tag = Some("billing-".to_owned());
        props
            .queue_properties
            .insert(AMQP_HEADERS_DEAD_LETTER_EXCHANGE.into(), "events.dead".into());

        let channel = AmqpChannel::connect(broker.transport(), props).await.unwrap();

        assert!(channel.is_connected());
        assert!(channel.consumer_tag().starts_with("billing-"));
        assert_eq!(broker.declared_exchanges(), vec!["events", "events.dead"]);
        assert!(channel.queue().is_none());
    }

    #[tokio::test]
    async fn connection_failure_is_surfaced() {
        let broker = FakeBroker::new();
        broker.fail_connects(1);

        let result = AmqpChannel::connect(broker.transport(), properties()).await;

        assert!(matches!(result, Err(AmqpError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn declare_queue_caches_descriptor() {
        let broker = FakeBroker::new();
        let mut channel = AmqpChannel::connect(broker.transport(), properties()).await.unwrap();

        let descriptor = channel.declare_queue().await.unwrap();

        assert_eq!(descriptor.name, "jobs");
        assert_eq!(channel.queue(), Some(&descriptor));
    }

    #[tokio::test]
    async fn failed_ack_is_remembered_and_channel_replaced() {
        let broker = FakeBroker::new();
        broker.fail_acks(1);
        let mut channel = AmqpChannel::connect(broker.transport(), properties()).await.unwrap();

        let msg = delivery("job-1", "jobs.created");
        assert_eq!(channel.acknowledge(&msg).await, Ok(Settlement::Deferred));

        assert_eq!(channel.redelivery.len(), 1);
        assert_eq!(broker.connects(), 2);
        assert!(broker.acks().is_empty());

        assert_eq!(channel.acknowledge(&msg).await, Ok(Settlement::Confirmed));
        assert_eq!(broker.acks(), vec![0]);
    }

    #[tokio::test]
    async fn failed_reject_is_forgotten_unless_final() {
        let broker = FakeBroker::new();
        broker.fail_rejects(1);
        let mut props = properties();
        props.queue_reject_is_final = false;
        let mut channel = AmqpChannel::connect(broker.transport(), props).await.unwrap();

        let msg = delivery("job-1", "jobs.created");
        assert_eq!(channel.reject(&msg, true).await, Ok(Settlement::Deferred));

        assert!(channel.redelivery.is_empty());
        assert_eq!(broker.connects(), 2);
    }

    #[tokio::test]
    async fn delivery_from_replaced_session_is_never_sent_to_the_broker() {
        let broker = FakeBroker::new();
        let mut channel = AmqpChannel::connect(broker.transport(), properties()).await.unwrap();

        let mut acked = delivery("job-1", "jobs.created");
        acked.generation = 1;
        let mut rejected = delivery("job-2", "jobs.created");
        rejected.generation = 1;
        channel.reconnect(true).await.unwrap();

        assert_eq!(channel.acknowledge(&acked).await, Ok(Settlement::Deferred));
        assert_eq!(channel.reject(&rejected, false).await, Ok(Settlement::Deferred));

        assert!(broker.acks().is_empty());
        assert!(broker.rejects().is_empty());
        assert_eq!(broker.connects(), 2);
        assert_eq!(channel.redelivery.len(), 2);
    }

    #[tokio::test]
    async fn delivery_from_live_session_is_settled() {
        let broker = FakeBroker::new();
        let mut channel = AmqpChannel::connect(broker.transport(), properties()).await.unwrap();

        let mut msg = delivery("job-1", "jobs.created");
        msg.generation = 1;

        assert_eq!(channel.acknowledge(&msg).await, Ok(Settlement::Confirmed));
        assert_eq!(broker.acks(), vec![0]);
        assert!(channel.redelivery.is_empty());
    }

    #[tokio::test]
    async fn disconnect_twice_raises_nothing() {
        let broker = FakeBroker::new();
        let mut channel = AmqpChannel::connect(broker.transport(), properties()).await.unwrap();

        channel.disconnect().await;
        channel.disconnect().await;

        assert!(!channel.is_connected());
        assert_eq!(broker.closes(), 1);
    }
}
