// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Outgoing messages are a body plus typed properties. Incoming messages are
//! wrapped in a [`Delivery`] which adds the broker-assigned envelope fields
//! (delivery tag, routing key, redelivered flag).

use serde::Deserialize;
use std::collections::BTreeMap;

/// Content type attached to messages published without one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// A header or argument value carried in AMQP field tables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl HeaderValue {
    /// Returns the value as a string slice if it holds one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Field table used for message headers and declaration arguments.
pub type Headers = BTreeMap<String, HeaderValue>;

/// AMQP delivery mode of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// Wire representation of the delivery mode.
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    /// Parses the wire representation, defaulting unknown values to transient.
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => DeliveryMode::Persistent,
            _ => DeliveryMode::Transient,
        }
    }
}

/// Properties of interest carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: Option<DeliveryMode>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
}

/// An outgoing (or received) message: opaque body plus properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Message {
    /// Creates a message with the given body and empty properties.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Message {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    /// Marks the message as persistent.
    pub fn persistent(mut self) -> Self {
        self.properties.delivery_mode = Some(DeliveryMode::Persistent);
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    /// Sets the reply-to address.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    /// Sets the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Adds a single header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: Message,
    /// Session generation the delivery arrived on; 0 when unknown.
    pub(crate) generation: u64,
}

impl Delivery {
    /// Message payload.
    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.properties.correlation_id.as_deref()
    }

    /// Queue the sender expects replies on.
    pub fn reply_to(&self) -> Option<&str> {
        self.message.properties.reply_to.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.message.properties.headers
    }
}
