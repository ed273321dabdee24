// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Every session opened through [`FakeBroker::transport`] records its RPCs in
//! shared state. Deliveries and faults are queued on the broker and handed to
//! whichever session consumes the target queue, so a reconnected session sees
//! what the dropped one left behind.

use crate::{
    config::ChannelProperties,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Message},
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
    transport::{ConsumerDefinition, QosDefinition, Session, Transport},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

/// A publish that reached the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

enum Event {
    Deliver { queue: String, delivery: Delivery },
    Fault(AmqpError),
}

#[derive(Clone, Copy)]
struct AutoReply {
    accept: bool,
    handle: bool,
}

#[derive(Default)]
struct State {
    connects: usize,
    closes: usize,
    connect_failures: usize,
    fail_close: bool,
    publish_attempts: usize,
    publish_failures: VecDeque<AmqpError>,
    published: Vec<Published>,
    exchanges: Vec<String>,
    queues: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
    deleted: Vec<String>,
    qos: Vec<QosDefinition>,
    consumers: Vec<ConsumerDefinition>,
    cancelled: Vec<String>,
    acks: Vec<u64>,
    ack_failures: usize,
    rejects: Vec<(u64, bool)>,
    reject_failures: usize,
    events: VecDeque<Event>,
    auto_reply: Option<AutoReply>,
    next_delivery_tag: u64,
    next_queue: u64,
}

/// Scriptable broker shared by every session it opens.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        FakeBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            state: self.state.clone(),
        })
    }

    /// Opens a session without going through a transport.
    pub fn open_session(&self) -> Box<dyn Session> {
        self.state().connects += 1;
        Box::new(FakeSession::new(self.state.clone()))
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn fail_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    pub fn fail_close(&self) {
        self.state().fail_close = true;
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.state().exchanges.clone()
    }

    pub fn declared_queues(&self) -> Vec<QueueDefinition> {
        self.state().queues.clone()
    }

    pub fn declared_queue_names(&self) -> Vec<String> {
        self.state().queues.iter().map(|q| q.name.clone()).collect()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state().bindings.clone()
    }

    pub fn deleted_queues(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.state().publish_attempts
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    /// Fails the next `count` publishes with `err`.
    pub fn fail_publishes(&self, count: usize, err: AmqpError) {
        let mut state = self.state();
        for _ in 0..count {
            state.publish_failures.push_back(err.clone());
        }
    }

    pub fn qos(&self) -> Vec<QosDefinition> {
        self.state().qos.clone()
    }

    pub fn consumers(&self) -> Vec<ConsumerDefinition> {
        self.state().consumers.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.state().rejects.clone()
    }

    /// Fails the next `count` acknowledgements with a channel fault.
    pub fn fail_acks(&self, count: usize) {
        self.state().ack_failures = count;
    }

    /// Fails the next `count` rejections with a channel fault.
    pub fn fail_rejects(&self, count: usize) {
        self.state().reject_failures = count;
    }

    /// Queues a delivery for the consumer of `queue`.
    pub fn deliver(&self, queue: &str, delivery: Delivery) {
        self.state().events.push_back(Event::Deliver {
            queue: queue.to_owned(),
            delivery,
        });
    }

    /// Queues a fault surfaced by the next wait.
    pub fn fault(&self, err: AmqpError) {
        self.state().events.push_back(Event::Fault(err));
    }

    /// Answers every request-shaped publish (one carrying `reply_to` and a
    /// correlation id) with an `_accepted` and/or `_handled` reply. Handled
    /// replies echo the request body prefixed with `done:`.
    pub fn auto_reply(&self, accept: bool, handle: bool) {
        self.state().auto_reply = Some(AutoReply { accept, handle });
    }
}

/// Builds a first-time delivery; the broker assigns the delivery tag.
pub fn delivery(body: &str, routing_key: &str) -> Delivery {
    Delivery {
        delivery_tag: 0,
        consumer_tag: String::new(),
        exchange: String::new(),
        routing_key: routing_key.to_owned(),
        redelivered: false,
        message: Message::new(body),
        generation: 0,
    }
}

/// Builds a delivery flagged as redelivered.
pub fn redelivery(body: &str, routing_key: &str) -> Delivery {
    Delivery {
        redelivered: true,
        ..delivery(body, routing_key)
    }
}

struct FakeTransport {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _: &ChannelProperties) -> Result<Box<dyn Session>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(Box::new(FakeSession::new(self.state.clone())))
    }
}

struct FakeSession {
    state: Arc<Mutex<State>>,
    /// consumer tag -> queue
    consumers: HashMap<String, String>,
}

impl FakeSession {
    fn new(state: Arc<Mutex<State>>) -> Self {
        FakeSession {
            state,
            consumers: HashMap::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn tag_for(&self, queue: &str) -> Option<String> {
        self.consumers
            .iter()
            .find(|(_, q)| q.as_str() == queue)
            .map(|(tag, _)| tag.clone())
    }

    fn next_event(&self) -> Option<Event> {
        let mut state = self.state();
        let position = state.events.iter().position(|event| match event {
            Event::Fault(_) => true,
            Event::Deliver { queue, .. } => self.consumers.values().any(|q| q == queue),
        })?;
        state.events.remove(position)
    }
}

fn reply(queue: &str, correlation_id: String, body: Vec<u8>) -> Event {
    let message = Message::new(body).with_correlation_id(correlation_id);

    Event::Deliver {
        queue: queue.to_owned(),
        delivery: Delivery {
            delivery_tag: 0,
            consumer_tag: String::new(),
            exchange: String::new(),
            routing_key: queue.to_owned(),
            redelivered: false,
            message,
            generation: 0,
        },
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn exchange_declare(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.state().exchanges.push(def.name.clone());
        Ok(())
    }

    async fn queue_declare(&mut self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError> {
        let mut state = self.state();
        let mut def = def.clone();
        if def.name.is_empty() {
            state.next_queue += 1;
            def.name = format!("amq.gen-{}", state.next_queue);
        }

        let descriptor = QueueDescriptor {
            name: def.name.clone(),
            message_count: 0,
            consumer_count: 0,
        };
        state.queues.push(def);
        Ok(descriptor)
    }

    async fn queue_bind(&mut self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.state().bindings.push(binding.clone());
        Ok(())
    }

    async fn queue_delete(&mut self, queue: &str) -> Result<(), AmqpError> {
        self.state().deleted.push(queue.to_owned());
        Ok(())
    }

    async fn basic_qos(&mut self, qos: &QosDefinition) -> Result<(), AmqpError> {
        self.state().qos.push(*qos);
        Ok(())
    }

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.publish_attempts += 1;
        if let Some(err) = state.publish_failures.pop_front() {
            return Err(err);
        }

        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message: message.clone(),
        });

        let props = &message.properties;
        if let (Some(auto), Some(reply_to), Some(id)) =
            (state.auto_reply, &props.reply_to, &props.correlation_id)
        {
            if auto.accept {
                let event = reply(reply_to, format!("{}_accepted", id), vec![]);
                state.events.push_back(event);
            }
            if auto.handle {
                let mut body = b"done:".to_vec();
                body.extend_from_slice(&message.body);
                let event = reply(reply_to, format!("{}_handled", id), body);
                state.events.push_back(event);
            }
        }

        Ok(())
    }

    async fn basic_consume(&mut self, def: &ConsumerDefinition) -> Result<(), AmqpError> {
        self.consumers.insert(def.tag.clone(), def.queue.clone());
        self.state().consumers.push(def.clone());
        Ok(())
    }

    async fn basic_cancel(&mut self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.consumers.remove(consumer_tag);
        self.state().cancelled.push(consumer_tag.to_owned());
        Ok(())
    }

    async fn basic_ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state();
        if state.ack_failures > 0 {
            state.ack_failures -= 1;
            return Err(AmqpError::ChannelFault("channel closed".to_owned()));
        }

        state.acks.push(delivery_tag);
        Ok(())
    }

    async fn basic_reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state();
        if state.reject_failures > 0 {
            state.reject_failures -= 1;
            return Err(AmqpError::ChannelFault("channel closed".to_owned()));
        }

        state.rejects.push((delivery_tag, requeue));
        Ok(())
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>, AmqpError> {
        if self.consumers.is_empty() {
            return Ok(None);
        }

        match self.next_event() {
            Some(Event::Fault(err)) => Err(err),
            Some(Event::Deliver {
                queue,
                mut delivery,
            }) => {
                delivery.consumer_tag = self.tag_for(&queue).unwrap_or_default();
                let mut state = self.state();
                state.next_delivery_tag += 1;
                delivery.delivery_tag = state.next_delivery_tag;
                Ok(Some(delivery))
            }
            None => match timeout {
                Some(timeout) => {
                    tokio::time::sleep(timeout).await;
                    Ok(None)
                }
                None => std::future::pending().await,
            },
        }
    }

    fn is_consuming(&self) -> bool {
        !self.consumers.is_empty()
    }

    async fn close(&mut self) -> Result<(), AmqpError> {
        self.consumers.clear();
        let mut state = self.state();
        state.closes += 1;
        if state.fail_close {
            return Err(AmqpError::ChannelFault("already closed".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unbounded_wait_without_deliveries_never_returns() {
        let broker = FakeBroker::new();
        let mut session = broker.open_session();
        session
            .basic_consume(&ConsumerDefinition {
                queue: "jobs".to_owned(),
                tag: "worker".to_owned(),
                no_ack: false,
                exclusive: false,
            })
            .await
            .unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(3600), session.wait(None)).await;

        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_without_consumers_returns_at_once() {
        let broker = FakeBroker::new();
        let mut session = broker.open_session();

        assert_eq!(session.wait(None).await, Ok(None));
    }
}
