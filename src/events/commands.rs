//! Command consumption with request-id deduplication.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::broker::{Broker, ReceivedMessage};
use crate::domain::{EventEnvelope, PublishRequest, PUBLISH_REQUEST};

use super::consumer::{ConsumerConfig, MessageProcessor, Settlement, SubscriptionLoop};

/// Default upper bound of remembered command ids
pub const DEFAULT_DEDUPE_CAPACITY: usize = 10_000;

/// Executes decoded commands
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> anyhow::Result<()>;
}

/// Bounded set of processed command ids.
///
/// When full, the whole set is dropped before inserting. A command
/// redelivered after such a clear is dispatched again.
#[derive(Debug)]
pub struct DedupeSet {
    seen: Mutex<HashSet<String>>,
    capacity: usize,
}

impl Default for DedupeSet {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_CAPACITY)
    }
}

impl DedupeSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.lock().map(|seen| seen.contains(id)).unwrap_or(false)
    }

    pub fn remember(&self, id: &str) {
        let Ok(mut seen) = self.seen.lock() else {
            return;
        };
        if seen.len() >= self.capacity && !seen.contains(id) {
            debug!(capacity = self.capacity, "Dedupe set full, clearing");
            seen.clear();
        }
        seen.insert(id.to_string());
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decodes command envelopes and dispatches each distinct request once
pub struct CommandProcessor {
    handler: Arc<dyn CommandHandler>,
    dedupe: DedupeSet,
}

impl CommandProcessor {
    pub fn new(handler: Arc<dyn CommandHandler>, dedupe_capacity: usize) -> Self {
        Self {
            handler,
            dedupe: DedupeSet::new(dedupe_capacity),
        }
    }

    pub fn dedupe(&self) -> &DedupeSet {
        &self.dedupe
    }

    /// Handle one decoded command.
    ///
    /// `Ok(true)` means the command was dispatched, `Ok(false)` that it was
    /// acknowledged without dispatch (duplicate, unknown or invalid).
    pub async fn handle_envelope(
        &self,
        envelope: &EventEnvelope,
        message_id: &str,
    ) -> anyhow::Result<bool> {
        if envelope.event != PUBLISH_REQUEST {
            debug!(event = %envelope.event, message_id, "Ignoring non-command event");
            return Ok(false);
        }

        let mut request = match PublishRequest::from_data(&envelope.data) {
            Ok(request) => request,
            Err(reason) => {
                warn!(message_id, reason = %reason, "Invalid publish request");
                return Ok(false);
            }
        };

        // The handler sees the dedup key as the request id
        let key = request
            .request_id
            .get_or_insert_with(|| message_id.to_string())
            .clone();
        if self.dedupe.contains(&key) {
            debug!(request_id = %key, "Duplicate command, acknowledging");
            return Ok(false);
        }

        info!(request_id = %key, edition_id = %request.edition_id, "Dispatching publish request");
        self.handler.publish(&request).await?;
        self.dedupe.remember(&key);
        Ok(true)
    }
}

#[async_trait]
impl MessageProcessor for CommandProcessor {
    async fn process(&self, message: &ReceivedMessage) -> Settlement {
        let envelope = match EventEnvelope::from_message_body(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Malformed command message");
                return Settlement::Abandon;
            }
        };

        match self.handle_envelope(&envelope, &message.message_id).await {
            Ok(_) => Settlement::Complete,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Command handler failed");
                Settlement::Abandon
            }
        }
    }
}

/// Consumer of the commands subscription
pub struct CommandConsumer {
    processor: Arc<CommandProcessor>,
    inner: SubscriptionLoop,
}

impl CommandConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ConsumerConfig,
        handler: Arc<dyn CommandHandler>,
        dedupe_capacity: usize,
    ) -> Self {
        let processor = Arc::new(CommandProcessor::new(handler, dedupe_capacity));
        Self {
            inner: SubscriptionLoop::new(broker, config, processor.clone()),
            processor,
        }
    }

    pub fn processor(&self) -> &Arc<CommandProcessor> {
        &self.processor
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

    #[test]
    fn test_dedupe_clears_wholesale_on_overflow() {
        let set = DedupeSet::new(3);
        for id in ["a", "b", "c"] {
            set.remember(id);
        }
        assert_eq!(set.len(), 3);

        set.remember("d");
        assert_eq!(set.len(), 1);
        assert!(set.contains("d"));
        assert!(!set.contains("a"));
    }

    #[test]
    fn test_remembering_known_id_does_not_clear() {
        let set = DedupeSet::new(2);
        set.remember("a");
        set.remember("b");
        set.remember("b");
        assert_eq!(set.len(), 2);
    }
}
