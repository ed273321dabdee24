// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the consume loop of [`AmqpChannel`]. It declares the
//! queue, applies quality of service, registers the consumer and then waits
//! for deliveries, handing each one to a [`ConsumerHandler`].
//!
//! Before a delivery reaches the handler:
//! 1. A redelivered message whose settlement was lost with a previous
//!    connection is settled again without calling the handler
//! 2. A message carrying both `reply_to` and a correlation id is answered
//!    with an `<id>_accepted` reply right away, and with the handler's
//!    response under `<id>_handled` once it returns
//!
//! The loop is an explicit state machine. Channel and protocol faults
//! reconnect and register the consumer again, up to `reconnect_attempts + 1`
//! consecutive times. A configured restart period replaces the connection
//! periodically. A wait timeout ends the loop.

use crate::{
    channel::{AmqpChannel, Settlement},
    config::ChannelProperties,
    errors::AmqpError,
    message::{Delivery, Message},
    otel::{self, CONSUMER_TRACER},
    request::{accepted_id, handled_id},
    transport::{ConsumerDefinition, QosDefinition},
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use crate::redelivery::Decision;

/// What a handler decided for a delivery, plus the response body sent back
/// to request/response callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub decision: Decision,
    pub response: Vec<u8>,
}

impl Outcome {
    /// Acknowledges the delivery.
    pub fn ack() -> Self {
        Outcome {
            decision: Decision::Ack,
            response: Vec::new(),
        }
    }

    /// Rejects the delivery, asking the broker to requeue it when `requeue`
    /// is set; otherwise it is dead-lettered or dropped.
    pub fn reject(requeue: bool) -> Self {
        Outcome {
            decision: Decision::Reject { requeue },
            response: Vec::new(),
        }
    }

    /// Sets the body published as the `_handled` reply.
    pub fn with_response(mut self, response: impl Into<Vec<u8>>) -> Self {
        self.response = response.into();
        self
    }
}

/// Handles deliveries taken from the queue.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes `delivery` within the trace context `ctx` propagated by the publisher.
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Outcome;
}

#[async_trait]
impl<F> ConsumerHandler for F
where
    F: Fn(&Delivery) -> Outcome + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Outcome {
        self(delivery)
    }
}

#[derive(Debug)]
enum ConsumerState {
    /// Declare the queue, apply QoS and register the consumer.
    Starting,
    /// Consumer registered on the session of `generation` since `since`.
    Running { since: Instant, generation: u64 },
    /// A fault broke the session.
    Reconnecting(AmqpError),
    /// The restart period elapsed.
    Restarting,
    Stopped,
}

impl AmqpChannel {
    /// Consumes the configured queue until the wait times out or the
    /// consumer is cancelled.
    ///
    /// Faults are healed by reconnecting. More than `reconnect_attempts + 1`
    /// consecutive faults without a delivery in between return the last one.
    pub async fn consume<H>(&mut self, handler: &H) -> Result<(), AmqpError>
    where
        H: ConsumerHandler + ?Sized,
    {
        let fault_limit = self.properties.reconnect_attempts.saturating_add(1);
        let mut faults = 0u32;
        let mut state = ConsumerState::Starting;

        loop {
            state = match state {
                ConsumerState::Starting => match self.start_consumer().await {
                    Ok(generation) => ConsumerState::Running {
                        since: Instant::now(),
                        generation,
                    },
                    Err(err) if err.restarts_consumer() => ConsumerState::Reconnecting(err),
                    Err(err) => {
                        error!(error = err.to_string(), "failure to start consumer");
                        return Err(err);
                    }
                },
                ConsumerState::Running { since, generation } => {
                    let next = self.run_cycle(handler, since, generation).await?;
                    if matches!(next, ConsumerState::Running { .. } | ConsumerState::Starting) {
                        faults = 0;
                    }
                    next
                }
                ConsumerState::Reconnecting(err) => {
                    faults += 1;
                    if faults > fault_limit {
                        error!(
                            error = err.to_string(),
                            faults, "consumer keeps faulting, giving up"
                        );
                        self.consuming = false;
                        return Err(err);
                    }

                    warn!(error = err.to_string(), faults, "consumer faulted, reconnecting");
                    self.connection.reconnect(true).await?;
                    ConsumerState::Starting
                }
                ConsumerState::Restarting => {
                    info!(consumer = %self.consumer_tag, "restart period elapsed, restarting consumer");
                    self.connection.reconnect(true).await?;
                    ConsumerState::Starting
                }
                ConsumerState::Stopped => {
                    self.cancel_consumer().await;
                    debug!(consumer = %self.consumer_tag, "consumer stopped");
                    return Ok(());
                }
            };
        }
    }

    async fn start_consumer(&mut self) -> Result<u64, AmqpError> {
        let queue = self.declare_queue().await?;
        let properties = self.properties.clone();
        let tag = self.consumer_tag.clone();
        let session = self.connection.session()?;

        if properties.qos {
            session
                .basic_qos(&QosDefinition {
                    prefetch_size: properties.qos_prefetch_size,
                    prefetch_count: properties.qos_prefetch_count,
                    global: properties.qos_a_global,
                })
                .await?;
        }

        session
            .basic_consume(&ConsumerDefinition {
                queue: queue.name.clone(),
                tag,
                no_ack: properties.consumer_no_ack,
                exclusive: properties.consumer_exclusive,
            })
            .await?;

        self.consuming = true;
        debug!(queue = %queue.name, consumer = %self.consumer_tag, "consumer registered");

        Ok(self.connection.generation())
    }

    async fn run_cycle<H>(
        &mut self,
        handler: &H,
        since: Instant,
        generation: u64,
    ) -> Result<ConsumerState, AmqpError>
    where
        H: ConsumerHandler + ?Sized,
    {
        if self.restart_due(since) {
            return Ok(ConsumerState::Restarting);
        }

        let timeout = wait_budget(&self.properties, since.elapsed());
        let delivery = match self.connection.wait(timeout).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) if self.restart_due(since) => return Ok(ConsumerState::Restarting),
            Ok(None) => return Ok(self.after_idle_wait()),
            Err(err) if err.restarts_consumer() => return Ok(ConsumerState::Reconnecting(err)),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for deliveries");
                return Err(err);
            }
        };

        match self.dispatch(handler, &delivery).await {
            Ok(()) => {}
            Err(err) if err.restarts_consumer() => return Ok(ConsumerState::Reconnecting(err)),
            Err(err) => return Err(err),
        }

        if !self.consuming {
            return Ok(self.after_cancel());
        }

        if self.connection.generation() != generation {
            debug!("session was replaced while handling, registering consumer again");
            return Ok(ConsumerState::Starting);
        }

        Ok(ConsumerState::Running { since, generation })
    }

    fn after_idle_wait(&self) -> ConsumerState {
        if !self.consuming {
            return self.after_cancel();
        }

        debug!(consumer = %self.consumer_tag, "consume wait timed out");
        ConsumerState::Stopped
    }

    fn after_cancel(&self) -> ConsumerState {
        if self.properties.persistent {
            ConsumerState::Starting
        } else {
            ConsumerState::Stopped
        }
    }

    fn restart_due(&self, since: Instant) -> bool {
        self.properties
            .restart_period()
            .is_some_and(|period| since.elapsed() >= period)
    }

    async fn dispatch<H>(&mut self, handler: &H, delivery: &Delivery) -> Result<(), AmqpError>
    where
        H: ConsumerHandler + ?Sized,
    {
        if delivery.redelivered {
            if let Some(pending) = self.redelivery.take_match(delivery) {
                info!(
                    routing_key = %delivery.routing_key,
                    decision = ?pending.decision,
                    "replaying settlement of redelivered message"
                );
                if !self.properties.consumer_no_ack {
                    self.settle(delivery, pending.decision).await?;
                }
                return Ok(());
            }
        }

        let (ctx, mut span) = otel::new_span(
            delivery.headers(),
            &global::tracer(CONSUMER_TRACER),
            &delivery.routing_key,
        );

        debug!(
            "received: {} - exchange: {}",
            delivery.routing_key, delivery.exchange
        );

        let request = match (delivery.reply_to(), delivery.correlation_id()) {
            (Some(reply_to), Some(id)) => Some((reply_to.to_owned(), id.to_owned())),
            _ => None,
        };

        if let Some((reply_to, id)) = &request {
            let accepted = Message::new(Vec::new()).with_correlation_id(accepted_id(id));
            if let Err(err) = self.publish_to("", reply_to, accepted).await {
                error!(error = err.to_string(), correlation_id = %id, "error whiling accepting request");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to accept request"),
                });
                return Err(err);
            }
        }

        let outcome = handler.exec(&ctx, delivery).await;

        if let Some((reply_to, id)) = &request {
            let handled = Message::new(outcome.response.clone()).with_correlation_id(handled_id(id));
            if let Err(err) = self.publish_to("", reply_to, handled).await {
                error!(error = err.to_string(), correlation_id = %id, "error whiling replying to request");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to reply to request"),
                });
                return Err(err);
            }
        }

        if self.properties.consumer_no_ack {
            span.set_status(Status::Ok);
            return Ok(());
        }

        match self.settle(delivery, outcome.decision).await {
            Ok(Settlement::Confirmed) => match outcome.decision {
                Decision::Ack => span.set_status(Status::Ok),
                Decision::Reject { .. } => span.set_status(Status::Error {
                    description: Cow::from("msg was rejected"),
                }),
            },
            Ok(Settlement::Deferred) => span.set_status(Status::Error {
                description: Cow::from("settlement deferred to redelivery"),
            }),
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to settle msg"),
                });
                return Err(err);
            }
        }

        Ok(())
    }

    async fn settle(
        &mut self,
        delivery: &Delivery,
        decision: Decision,
    ) -> Result<Settlement, AmqpError> {
        match decision {
            Decision::Ack => self.acknowledge(delivery).await,
            Decision::Reject { requeue } => self.reject(delivery, requeue).await,
        }
    }
}

/// Wait budget of one cycle; it never outlasts the restart period.
fn wait_budget(properties: &ChannelProperties, elapsed: Duration) -> Option<Duration> {
    let remaining = properties
        .restart_period()
        .map(|period| period.saturating_sub(elapsed));

    match (properties.consume_timeout(), remaining) {
        (Some(timeout), Some(remaining)) => Some(timeout.min(remaining)),
        (timeout, remaining) => timeout.or(remaining),
    }
}
