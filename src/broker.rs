// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin-backed Transport
//!
//! This module implements [`Transport`] and [`Session`] on top of `lapin`. It
//! owns everything that touches the wire: AMQP URI handling, TLS, the
//! conversion between the crate's message types and lapin's field tables, and
//! the classification of `lapin::Error` into recoverable and fatal faults.

use crate::{
    config::{ChannelProperties, TlsOptions},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, DeliveryMode, HeaderValue, Headers, Message, MessageProperties},
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
    transport::{ConsumerDefinition, QosDefinition, Session, Transport},
};
use async_trait::async_trait;
use futures_util::{future::select_all, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use tracing::{debug, error, warn};

/// Connection name reported to the broker when none is configured
pub const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-channel";

/// Opens lapin connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinTransport;

/// One lapin connection with a single channel and its registered consumers.
pub struct LapinSession {
    connection: Connection,
    channel: Channel,
    consumers: HashMap<String, Consumer>,
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, properties: &ChannelProperties) -> Result<Box<dyn Session>, AmqpError> {
        debug!(endpoint = %properties.identifier(), "creating amqp connection...");

        let name = properties
            .connection_name
            .clone()
            .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_owned());
        let options = ConnectionProperties::default().with_connection_name(LongString::from(name));
        let uri = properties.uri();

        let connected = match &properties.tls {
            Some(tls) => {
                Connection::connect_with_config(uri.unsecure(), options, tls_config(tls)?).await
            }
            None => Connection::connect(uri.unsecure(), options).await,
        };

        let connection = match connected {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Box::new(LapinSession {
                    connection,
                    channel,
                    consumers: HashMap::new(),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if let Err(close_err) = connection.close(200, "OK").await {
                    warn!(error = close_err.to_string(), "error closing half-open connection");
                }
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

fn tls_config(tls: &TlsOptions) -> Result<OwnedTLSConfig, AmqpError> {
    let cert_chain = match &tls.ca_certificate {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|err| {
            error!(error = err.to_string(), path = %path.display(), "failure to read ca certificate");
            AmqpError::ConnectionError(err.to_string())
        })?),
        None => None,
    };

    Ok(OwnedTLSConfig {
        identity: None,
        cert_chain,
    })
}

/// Classifies a lapin error into the crate's fault kinds.
pub(crate) fn fault(err: &lapin::Error) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(_) => AmqpError::ProtocolFault(err.to_string()),
        lapin::Error::MissingHeartbeatError
        | lapin::Error::InvalidChannel(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => AmqpError::ChannelFault(err.to_string()),
        _ => AmqpError::InternalError(err.to_string()),
    }
}

/// Keeps recoverable faults as such and reports everything else as `otherwise`.
fn classify(err: &lapin::Error, otherwise: impl FnOnce() -> AmqpError) -> AmqpError {
    let classified = fault(err);
    if classified.is_recoverable() {
        classified
    } else {
        otherwise()
    }
}

#[async_trait]
impl Session for LapinSession {
    async fn exchange_declare(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                field_table(&def.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = %def.name, "error to declare the exchange");
                classify(&err, || AmqpError::DeclareExchangeError(def.name.clone()))
            })
    }

    async fn queue_declare(&mut self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                field_table(&def.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                classify(&err, || AmqpError::DeclareQueueError(def.name.clone()))
            })?;

        Ok(QueueDescriptor {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(&mut self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                classify(&err, || {
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange.clone(),
                        binding.queue.clone(),
                    )
                })
            })
    }

    async fn queue_delete(&mut self, queue: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| fault(&err))
    }

    async fn basic_qos(&mut self, qos: &QosDefinition) -> Result<(), AmqpError> {
        if qos.prefetch_size > 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "prefetch size is not supported by the client, only the count is applied"
            );
        }

        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                classify(&err, || AmqpError::QoSDeclarationError(err.to_string()))
            })
    }

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                basic_properties(&message.properties),
            )
            .await
            .map_err(|err| classify(&err, || AmqpError::PublishingError(err.to_string())))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|err| classify(&err, || AmqpError::PublishingError(err.to_string())))
    }

    async fn basic_consume(&mut self, def: &ConsumerDefinition) -> Result<(), AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                &def.queue,
                &def.tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: def.no_ack,
                    exclusive: def.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                classify(&err, || AmqpError::ConsumerDeclarationError(def.queue.clone()))
            })?;

        self.consumers.insert(def.tag.clone(), consumer);
        Ok(())
    }

    async fn basic_cancel(&mut self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.consumers.remove(consumer_tag);
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| fault(&err))
    }

    async fn basic_ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| fault(&err))
    }

    async fn basic_reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| fault(&err))
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>, AmqpError> {
        if self.consumers.is_empty() {
            return Ok(None);
        }

        let next = select_all(self.consumers.iter_mut().map(|(tag, consumer)| {
            Box::pin(async move { (tag.clone(), consumer.next().await) })
        }));

        let ((tag, item), _, _) = match timeout {
            Some(limit) => match tokio::time::timeout(limit, next).await {
                Ok(ready) => ready,
                Err(_) => return Ok(None),
            },
            None => next.await,
        };

        match item {
            Some(Ok(delivery)) => Ok(Some(into_delivery(tag, delivery))),
            Some(Err(err)) => {
                error!(error = err.to_string(), consumer = %tag, "errors consume msg");
                Err(fault(&err))
            }
            None => {
                self.consumers.remove(&tag);
                Err(AmqpError::ChannelFault(format!("consumer `{}` stream closed", tag)))
            }
        }
    }

    fn is_consuming(&self) -> bool {
        !self.consumers.is_empty()
    }

    async fn close(&mut self) -> Result<(), AmqpError> {
        self.consumers.clear();

        if self.channel.status().connected() {
            self.channel
                .close(200, "OK")
                .await
                .map_err(|err| fault(&err))?;
        }

        if self.connection.status().connected() {
            self.connection
                .close(200, "OK")
                .await
                .map_err(|err| fault(&err))?;
        }

        Ok(())
    }
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default().with_headers(field_table(&props.headers));

    if let Some(mode) = props.delivery_mode {
        properties = properties.with_delivery_mode(mode.as_u8());
    }
    if let Some(id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(message_id.clone()));
    }

    properties
}

fn into_delivery(consumer_tag: String, delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        delivery_mode: (*props.delivery_mode()).map(DeliveryMode::from_u8),
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        headers: props.headers().as_ref().map(headers).unwrap_or_default(),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        message: Message {
            body: delivery.data,
            properties,
        },
        generation: 0,
    }
}

/// Converts crate headers into an AMQP field table.
fn field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts an AMQP field table into crate headers, skipping nested values.
fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.to_string(), v)))
        .collect()
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::ShortString(v) => Some(HeaderValue::String(v.to_string())),
        AMQPValue::LongString(v) => Some(HeaderValue::String(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}
