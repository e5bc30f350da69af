//! Message broker contract.
//!
//! Topics fan out to named subscriptions. Receivers use peek-lock delivery:
//! a received message stays invisible to other receivers until it is
//! completed (removed) or abandoned (made visible again). Messages abandoned
//! too many times are dead-lettered.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The connection dropped; the caller should reconnect
    #[error("Broker disconnected: {0}")]
    Disconnected(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A message to send to a topic
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub body: String,

    /// Envelope event name, carried as a message property
    pub event_type: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            body: body.into(),
            event_type: None,
        }
    }

    pub fn with_event_type(mut self, event: impl Into<String>) -> Self {
        self.event_type = Some(event.into());
        self
    }
}

/// A locked message handed to a receiver
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    pub event_type: Option<String>,

    /// Token identifying this delivery's lock
    pub lock_token: String,

    /// 1 on first delivery
    pub delivery_count: u32,
}

/// Broker connection factory
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    /// Open a sender for a topic
    async fn sender(&self, topic: &str) -> Result<Arc<dyn TopicSender>, BrokerError>;

    /// Open a receiver on a topic subscription, creating the subscription if needed
    async fn receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn SubscriptionReceiver>, BrokerError>;
}

#[async_trait]
pub trait TopicSender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait SubscriptionReceiver: Send + Sync {
    /// Wait up to `max_wait` for at most `max_count` messages.
    ///
    /// An empty batch is a normal result, not an error.
    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    /// Remove a message from the subscription
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Release the lock so the message is delivered again
    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;
}
