//! Best-effort lifecycle event publishing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, OutboundMessage, TopicSender};
use crate::domain::{EventData, EventEnvelope};

/// Publishes lifecycle events. Never fails: delivery is best effort.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &str, data: EventData);
}

/// Publisher sending envelopes to a broker topic.
///
/// Without a broker it logs once and drops every event.
pub struct BrokerPublisher {
    broker: Option<Arc<dyn Broker>>,
    topic: String,
    sender: Mutex<Option<Arc<dyn TopicSender>>>,
}

impl BrokerPublisher {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker: Some(broker),
            topic: topic.into(),
            sender: Mutex::new(None),
        }
    }

    /// Publisher that drops everything (no broker configured)
    pub fn disabled(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        warn!(topic = %topic, "No broker configured, lifecycle events will not be published");
        Self {
            broker: None,
            topic,
            sender: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.broker.is_some()
    }

    /// Send an envelope, reporting failures to the caller
    pub async fn try_send(&self, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        let Some(ref broker) = self.broker else {
            return Err(BrokerError::Unavailable("no broker configured".to_string()));
        };

        let body = envelope.to_message_body()?;
        let message = OutboundMessage::new(body).with_event_type(envelope.event.clone());

        let mut cached = self.sender.lock().await;
        let sender = match cached.as_ref() {
            Some(sender) => Arc::clone(sender),
            None => {
                let sender = broker.sender(&self.topic).await?;
                *cached = Some(Arc::clone(&sender));
                sender
            }
        };

        if let Err(e) = sender.send(message).await {
            // Reopen on the next publish
            *cached = None;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for BrokerPublisher {
    async fn publish(&self, event: &str, data: EventData) {
        if self.broker.is_none() {
            return;
        }

        let envelope = EventEnvelope::new(event, data);
        match self.try_send(&envelope).await {
            Ok(()) => debug!(event, topic = %self.topic, "Published event"),
            Err(e) => warn!(event, topic = %self.topic, error = %e, "Failed to publish event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disabled_publisher_is_silent_no_op() {
        let publisher = BrokerPublisher::disabled("pipeline-events");
        publisher
            .publish("run-start", EventData::Text("x".to_string()))
            .await;
        assert!(!publisher.is_enabled());
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed_and_recovers() {
        let broker = MemoryBroker::default();
        let rx = broker.receiver("events", "web").await.unwrap();
        let publisher = BrokerPublisher::new(Arc::new(broker.clone()), "events");

        broker.set_unavailable(true);
        publisher.publish("run-start", EventData::Text("lost".to_string())).await;

        broker.set_unavailable(false);
        publisher.publish("run-start", EventData::Text("kept".to_string())).await;

        let batch = rx.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        let envelope = EventEnvelope::from_message_body(&batch[0].body).unwrap();
        assert_eq!(envelope.data, EventData::Text("kept".to_string()));
        assert_eq!(batch[0].event_type.as_deref(), Some("run-start"));
    }
}
