//! Reconnecting subscription consumers.
//!
//! The receive loop survives any broker failure: it drops the receiver,
//! sleeps with jittered exponential backoff and reconnects. A receive call
//! that returns (even with no messages) resets the backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::broker::{Broker, ReceivedMessage, SubscriptionReceiver};
use crate::core::lifecycle::{sleep_or_shutdown, Background};
use crate::domain::EventEnvelope;

use super::backoff::{ReconnectBackoff, ReconnectState};

/// Settings for one consumer loop
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub subscription: String,
    pub max_messages: usize,
    pub max_wait: Duration,
    pub backoff: ReconnectBackoff,
    pub shutdown_grace: Duration,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            max_messages: 10,
            max_wait: Duration::from_secs(5),
            backoff: ReconnectBackoff::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// What to do with a message once processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Complete,
    Abandon,
}

/// Per-message logic plugged into the receive loop
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &ReceivedMessage) -> Settlement;
}

/// Receive loop bound to one subscription
pub struct SubscriptionLoop {
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    processor: Arc<dyn MessageProcessor>,
    background: Mutex<Background>,
}

impl SubscriptionLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ConsumerConfig,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        Self {
            broker,
            config,
            processor,
            background: Mutex::new(Background::default()),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Start the loop. No-op if already running.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        let started = background.start(|shutdown| {
            let broker = Arc::clone(&self.broker);
            let config = self.config.clone();
            let processor = Arc::clone(&self.processor);
            let shutdown = shutdown.clone();
            vec![tokio::spawn(receive_loop(broker, config, processor, shutdown))]
        });
        if started {
            info!(
                topic = %self.config.topic,
                subscription = %self.config.subscription,
                "Consumer started"
            );
        }
    }

    /// Stop the loop and wait for it. No-op if not running.
    pub async fn stop(&self) {
        let mut background = self.background.lock().await;
        if background
            .stop(&self.config.subscription, self.config.shutdown_grace)
            .await
        {
            info!(subscription = %self.config.subscription, "Consumer stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.background.lock().await.is_running()
    }
}

async fn receive_loop(
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    processor: Arc<dyn MessageProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnect = ReconnectState::new(config.backoff);
    let mut receiver: Option<Box<dyn SubscriptionReceiver>> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let failure = match receiver {
            Some(ref rx) => {
                let received = tokio::select! {
                    received = rx.receive(config.max_messages, config.max_wait) => received,
                    _ = shutdown.changed() => break,
                };
                match received {
                    Ok(messages) => {
                        reconnect.on_success();
                        for message in &messages {
                            settle(rx.as_ref(), processor.as_ref(), message, &config).await;
                        }
                        None
                    }
                    Err(e) => Some(e.to_string()),
                }
            }
            None => match broker.receiver(&config.topic, &config.subscription).await {
                Ok(rx) => {
                    debug!(subscription = %config.subscription, "Connected to subscription");
                    receiver = Some(rx);
                    None
                }
                Err(e) => Some(e.to_string()),
            },
        };

        if let Some(error) = failure {
            receiver = None;
            let attempt = reconnect.attempt();
            let delay = reconnect.on_failure();
            warn!(
                subscription = %config.subscription,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Consumer receive failed, reconnecting"
            );
            if sleep_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
    }
}

async fn settle(
    rx: &dyn SubscriptionReceiver,
    processor: &dyn MessageProcessor,
    message: &ReceivedMessage,
    config: &ConsumerConfig,
) {
    let result = match processor.process(message).await {
        Settlement::Complete => rx.complete(message).await,
        Settlement::Abandon => rx.abandon(message).await,
    };
    if let Err(e) = result {
        warn!(
            subscription = %config.subscription,
            message_id = %message.message_id,
            error = %e,
            "Failed to settle message"
        );
    }
}

/// Local fan-out target for decoded events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, envelope: EventEnvelope) -> anyhow::Result<()>;
}

/// Sink re-broadcasting events to in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn dispatch(&self, envelope: EventEnvelope) -> anyhow::Result<()> {
        if self.tx.send(envelope).is_err() {
            debug!("No local listeners for event");
        }
        Ok(())
    }
}

/// Decodes lifecycle events and hands them to a sink
pub struct EventProcessor {
    sink: Arc<dyn EventSink>,
}

impl EventProcessor {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageProcessor for EventProcessor {
    async fn process(&self, message: &ReceivedMessage) -> Settlement {
        let envelope = match EventEnvelope::from_message_body(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Malformed event message");
                return Settlement::Abandon;
            }
        };

        let event = envelope.event.clone();
        match self.sink.dispatch(envelope).await {
            Ok(()) => Settlement::Complete,
            Err(e) => {
                warn!(message_id = %message.message_id, event = %event, error = %e, "Event sink failed");
                Settlement::Abandon
            }
        }
    }
}

/// Consumer of the lifecycle events subscription
pub struct EventConsumer {
    inner: SubscriptionLoop,
}

impl EventConsumer {
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: SubscriptionLoop::new(broker, config, Arc::new(EventProcessor::new(sink))),
        }
    }

    pub async fn start(&self) {
        self.inner.start().await
    }

    pub async fn stop(&self) {
        self.inner.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.inner.is_running().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> ReceivedMessage {
        ReceivedMessage {
            message_id: "m-1".to_string(),
            body: body.to_string(),
            event_type: None,
            lock_token: "t-1".to_string(),
            delivery_count: 1,
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_abandoned() {
        let processor = EventProcessor::new(Arc::new(BroadcastSink::new(8)));
        assert_eq!(processor.process(&message("{not json")).await, Settlement::Abandon);
    }

    #[tokio::test]
    async fn test_event_reaches_local_listener() {
        let sink = BroadcastSink::new(8);
        let mut listener = sink.subscribe();
        let processor = EventProcessor::new(Arc::new(sink));

        let settled = processor
            .process(&message(r#"{"event":"run-start","data":{"id":"r-1"}}"#))
            .await;
        assert_eq!(settled, Settlement::Complete);
        assert_eq!(listener.recv().await.unwrap().event, "run-start");
    }
}
