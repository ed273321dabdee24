// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! The [`ConnectionManager`] owns at most one live [`Session`] at a time. A
//! reconnect closes whatever is left of the current session, opens a new one
//! and re-declares the exchanges on it. Old sessions are dropped, never
//! reused.

use crate::{
    config::ChannelProperties,
    errors::AmqpError,
    message::Delivery,
    topology::AmqpTopology,
    transport::{Session, Transport},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Outcome of a successful reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The caller asked for the reconnect and continues where it left off.
    Resumed,
    /// The reconnect happened underneath the caller; loops bound to the old
    /// session (consumers, pending waits) must start over.
    ResumedSilently,
}

/// Opens, replaces and closes the session of one channel.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    properties: Arc<ChannelProperties>,
    session: Option<Box<dyn Session>>,
    generation: u64,
}

impl ConnectionManager {
    /// Creates a manager without opening anything.
    ///
    /// # Parameters
    /// * `transport` - Opens the sessions
    /// * `properties` - Endpoint and topology of the channel
    ///
    /// # Returns
    /// A disconnected manager; call [`establish`](ConnectionManager::establish)
    /// before issuing RPCs.
    pub fn new(transport: Arc<dyn Transport>, properties: Arc<ChannelProperties>) -> Self {
        ConnectionManager {
            transport,
            properties,
            session: None,
            generation: 0,
        }
    }

    /// Opens a new session, replacing (without closing) any previous one.
    pub async fn connect(&mut self) -> Result<(), AmqpError> {
        let session = self.transport.connect(&self.properties).await?;
        self.session = Some(session);
        self.generation += 1;
        debug!(generation = self.generation, "session established");
        Ok(())
    }

    /// Connects and declares the exchanges.
    pub async fn establish(&mut self) -> Result<(), AmqpError> {
        self.connect().await?;
        let properties = self.properties.clone();
        AmqpTopology::new(&properties)
            .declare_exchange(self.session()?)
            .await
    }

    /// Replaces the session with a fresh one and re-declares the exchanges.
    ///
    /// Close-time errors of the old session are swallowed: the link is
    /// assumed broken already.
    pub async fn reconnect(&mut self, intentional: bool) -> Result<ReconnectOutcome, AmqpError> {
        info!(
            endpoint = %self.properties.identifier(),
            intentional, "reconnecting to the broker"
        );

        self.disconnect().await;
        self.establish().await?;

        if intentional {
            Ok(ReconnectOutcome::Resumed)
        } else {
            Ok(ReconnectOutcome::ResumedSilently)
        }
    }

    /// Closes the session if there is one. Calling it again is a no-op.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.close().await {
                warn!(error = err.to_string(), "error closing the session, discarding it");
            }
        }
    }

    /// The live session, or a recoverable fault when there is none.
    pub fn session(&mut self) -> Result<&mut dyn Session, AmqpError> {
        match self.session.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(AmqpError::ChannelFault("no live session".to_owned())),
        }
    }

    /// Waits for the next delivery on the live session, tagging it with the
    /// session's generation.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>, AmqpError> {
        let generation = self.generation;
        let mut delivery = self.session()?.wait(timeout).await?;
        if let Some(delivery) = delivery.as_mut() {
            delivery.generation = generation;
        }

        Ok(delivery)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Increments every time a session is opened; lets callers notice that
    /// the session they registered state on has been replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn properties(&self) -> &Arc<ChannelProperties> {
        &self.properties
    }
}
