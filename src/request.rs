// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Response over Queues
//!
//! This module implements synchronous calls on top of one-way queues. The
//! caller declares a private reply queue, publishes its messages with a
//! shared correlation id and `reply_to` pointing at that queue, and then
//! listens for replies:
//!
//! - `<id>_accepted` tells the caller the consumer received the request
//! - `<id>_handled` carries the consumer's response, one per message
//!
//! The call completes when every message has been handled. It gives up once
//! the acceptance deadline passes without an `_accepted` reply, or once the
//! handling deadline passes. Giving up is reported as `false`, not as an
//! error. The reply queue is deleted in every case.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    message::{Delivery, Message},
    queue::QueueDefinition,
    transport::ConsumerDefinition,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Correlation id suffix of the "request received" reply
pub const ACCEPTED_SUFFIX: &str = "_accepted";
/// Correlation id suffix of the reply carrying the response
pub const HANDLED_SUFFIX: &str = "_handled";
/// Consumer tag of the reply queue listener
pub const REQUEST_LISTENER_TAG: &str = "request-exclusive-listener";

pub(crate) fn accepted_id(id: &str) -> String {
    format!("{}{}", id, ACCEPTED_SUFFIX)
}

pub(crate) fn handled_id(id: &str) -> String {
    format!("{}{}", id, HANDLED_SUFFIX)
}

/// Per-call overrides of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Correlation id; generated when absent.
    pub correlation_id: Option<String>,
    /// Overrides `request_accepted_timeout`.
    pub accepted_timeout: Option<Duration>,
    /// Overrides `request_handled_timeout`.
    pub handled_timeout: Option<Duration>,
}

impl RequestOptions {
    /// Uses `id` instead of a generated correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// How long to wait for the first `_accepted` reply.
    pub fn accepted_timeout(mut self, timeout: Duration) -> Self {
        self.accepted_timeout = Some(timeout);
        self
    }

    /// How long to wait for every `_handled` reply.
    pub fn handled_timeout(mut self, timeout: Duration) -> Self {
        self.handled_timeout = Some(timeout);
        self
    }
}

/// Classification of a message arriving on the reply queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Accepted,
    Handled,
    Unrelated,
}

/// State of one request/response call.
#[derive(Debug, Clone)]
pub struct CorrelationRequest {
    pub id: String,
    pub sent: usize,
    pub accepted: usize,
    pub handled: usize,
    pub accepted_deadline: Instant,
    pub handled_deadline: Instant,
}

impl CorrelationRequest {
    /// Starts both deadlines now.
    pub fn new(
        id: &str,
        sent: usize,
        accepted_timeout: Duration,
        handled_timeout: Duration,
    ) -> CorrelationRequest {
        let now = Instant::now();
        CorrelationRequest {
            id: id.to_owned(),
            sent,
            accepted: 0,
            handled: 0,
            accepted_deadline: now + accepted_timeout,
            handled_deadline: now + handled_timeout,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted > 0
    }

    pub fn is_complete(&self) -> bool {
        self.handled == self.sent
    }

    /// Whether the call should keep listening at `now`.
    pub fn keep_waiting(&self, now: Instant) -> bool {
        (now < self.accepted_deadline || self.is_accepted())
            && now < self.handled_deadline
            && self.handled < self.sent
    }

    /// Time left until the next deadline that can end the call.
    pub fn wait_budget(&self, now: Instant) -> Duration {
        let deadline = if self.is_accepted() {
            self.handled_deadline
        } else {
            self.accepted_deadline.min(self.handled_deadline)
        };

        deadline.saturating_duration_since(now)
    }

    /// Counts a reply carrying `correlation_id`.
    pub fn observe(&mut self, correlation_id: Option<&str>) -> Reply {
        let Some(reply) = correlation_id.and_then(|cid| cid.strip_prefix(self.id.as_str())) else {
            return Reply::Unrelated;
        };

        match reply {
            ACCEPTED_SUFFIX => {
                self.accepted += 1;
                Reply::Accepted
            }
            HANDLED_SUFFIX => {
                self.handled += 1;
                Reply::Handled
            }
            _ => Reply::Unrelated,
        }
    }
}

impl AmqpChannel {
    /// Publishes `messages` to `route` and waits for a handled reply to each.
    ///
    /// `callback` runs once per `_handled` reply. Returns whether every
    /// message was handled before the deadlines.
    pub async fn request<F>(
        &mut self,
        route: &str,
        messages: Vec<Vec<u8>>,
        mut callback: F,
        options: RequestOptions,
    ) -> Result<bool, AmqpError>
    where
        F: FnMut(&Delivery) + Send,
    {
        if !self.connection.is_connected() {
            self.connection.establish().await?;
        }

        let reply_queue = self
            .connection
            .session()?
            .queue_declare(&QueueDefinition::reply_queue())
            .await?;

        let id = match options.correlation_id {
            Some(id) => {
                if id.ends_with(ACCEPTED_SUFFIX) || id.ends_with(HANDLED_SUFFIX) {
                    warn!(
                        correlation_id = %id,
                        "correlation id ends with a reply suffix, replies may be misread"
                    );
                }
                id
            }
            None => format!("{}_{}", Uuid::new_v4().simple(), messages.len()),
        };

        let accepted_timeout = options
            .accepted_timeout
            .unwrap_or(self.properties.request_accepted_timeout);
        let handled_timeout = options
            .handled_timeout
            .unwrap_or(self.properties.request_handled_timeout);

        let sent = messages.len();
        let generation = self.connection.generation();
        let mut listening = false;

        let result = match self.publish_request(route, messages, &id, &reply_queue.name).await {
            Err(err) => Err(err),
            Ok(()) if self.connection.generation() != generation => {
                warn!(
                    correlation_id = %id,
                    "connection replaced while publishing the request, the reply queue is gone"
                );
                Ok(false)
            }
            Ok(()) => match self.listen_on(&reply_queue.name).await {
                Ok(()) => {
                    listening = true;
                    let request =
                        CorrelationRequest::new(&id, sent, accepted_timeout, handled_timeout);
                    self.collect_replies(request, &mut callback).await
                }
                Err(err) => Err(err),
            },
        };

        self.release_reply_queue(&reply_queue.name, listening).await;

        result
    }

    /// Single-message request returning the last handled response body.
    pub async fn request_with_response(
        &mut self,
        route: &str,
        body: impl Into<Vec<u8>>,
        options: RequestOptions,
    ) -> Result<Option<Vec<u8>>, AmqpError> {
        let mut response = None;
        self.request(
            route,
            vec![body.into()],
            |delivery: &Delivery| response = Some(delivery.body().to_vec()),
            options,
        )
        .await?;

        Ok(response)
    }

    async fn publish_request(
        &mut self,
        route: &str,
        messages: Vec<Vec<u8>>,
        id: &str,
        reply_queue: &str,
    ) -> Result<(), AmqpError> {
        let exchange = self.properties.exchange.clone();

        for body in messages {
            let message = Message::new(body)
                .with_correlation_id(id)
                .with_reply_to(reply_queue);
            self.publish_to(&exchange, route, message).await?;
        }

        Ok(())
    }

    async fn listen_on(&mut self, reply_queue: &str) -> Result<(), AmqpError> {
        self.connection
            .session()?
            .basic_consume(&ConsumerDefinition {
                queue: reply_queue.to_owned(),
                tag: REQUEST_LISTENER_TAG.to_owned(),
                no_ack: true,
                exclusive: true,
            })
            .await
    }

    /// Waits for replies until `request` completes or a deadline passes.
    async fn collect_replies<F>(
        &mut self,
        mut request: CorrelationRequest,
        callback: &mut F,
    ) -> Result<bool, AmqpError>
    where
        F: FnMut(&Delivery) + Send,
    {
        loop {
            let now = Instant::now();
            if !request.keep_waiting(now) {
                break;
            }

            match self.connection.wait(Some(request.wait_budget(now))).await {
                Ok(Some(delivery)) => match request.observe(delivery.correlation_id()) {
                    Reply::Accepted => debug!(correlation_id = %request.id, "request accepted"),
                    Reply::Handled => callback(&delivery),
                    Reply::Unrelated => debug!(
                        correlation_id = ?delivery.correlation_id(),
                        "ignoring unrelated reply"
                    ),
                },
                Ok(None) => {}
                Err(err) if err.is_recoverable() => {
                    warn!(
                        error = err.to_string(),
                        correlation_id = %request.id,
                        "reply queue lost with the channel"
                    );
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }

        debug!(
            correlation_id = %request.id,
            sent = request.sent,
            handled = request.handled,
            "request finished"
        );

        Ok(request.is_complete())
    }

    async fn release_reply_queue(&mut self, reply_queue: &str, listening: bool) {
        let Ok(session) = self.connection.session() else {
            return;
        };

        if listening {
            if let Err(err) = session.basic_cancel(REQUEST_LISTENER_TAG).await {
                warn!(error = err.to_string(), "error cancelling the reply listener");
            }
        }

        if let Err(err) = session.queue_delete(reply_queue).await {
            warn!(error = err.to_string(), queue = reply_queue, "error deleting the reply queue");
        }
    }
}
