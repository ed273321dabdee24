// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redelivery Deduplication
//!
//! When an acknowledgement or rejection cannot be confirmed to the broker
//! because the channel went down, the broker will redeliver the message to
//! the next consumer. The [`RedeliveryCache`] remembers the decision that was
//! already taken so the redelivered copy is settled the same way without
//! running the handler a second time.
//!
//! Entries are matched on body and routing key and consumed by the first
//! match.

use crate::message::Delivery;

/// A settlement decision for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Ack,
    Reject { requeue: bool },
}

/// A decision that never reached the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDecision {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub decision: Decision,
}

impl PendingDecision {
    fn matches(&self, delivery: &Delivery) -> bool {
        self.body == delivery.body() && self.routing_key == delivery.routing_key
    }
}

/// Pending acknowledgements and rejections awaiting their redelivery.
#[derive(Debug, Default)]
pub struct RedeliveryCache {
    acknowledgements: Vec<PendingDecision>,
    rejections: Vec<PendingDecision>,
}

impl RedeliveryCache {
    pub fn new() -> Self {
        RedeliveryCache::default()
    }

    /// Remembers an acknowledgement of `delivery`.
    pub fn remember_ack(&mut self, delivery: &Delivery) {
        self.acknowledgements.push(PendingDecision {
            body: delivery.body().to_vec(),
            routing_key: delivery.routing_key.clone(),
            decision: Decision::Ack,
        });
    }

    /// Remembers a rejection of `delivery`.
    pub fn remember_reject(&mut self, delivery: &Delivery, requeue: bool) {
        self.rejections.push(PendingDecision {
            body: delivery.body().to_vec(),
            routing_key: delivery.routing_key.clone(),
            decision: Decision::Reject { requeue },
        });
    }

    /// Removes and returns the decision remembered for `delivery`, if any.
    ///
    /// Acknowledgements are searched before rejections.
    pub fn take_match(&mut self, delivery: &Delivery) -> Option<PendingDecision> {
        for pending in [&mut self.acknowledgements, &mut self.rejections] {
            if let Some(idx) = pending.iter().position(|entry| entry.matches(delivery)) {
                return Some(pending.swap_remove(idx));
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.acknowledgements.len() + self.rejections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
