//! In-process broker with peek-lock subscriptions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    Broker, BrokerError, OutboundMessage, ReceivedMessage, SubscriptionReceiver, TopicSender,
};

#[derive(Debug, Clone)]
struct Stored {
    message: OutboundMessage,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Subscription {
    pending: VecDeque<Stored>,
    locked: HashMap<String, (Stored, Instant)>,
    dead_letters: Vec<Stored>,
}

#[derive(Debug, Default)]
struct State {
    /// topic -> subscription -> queue
    topics: HashMap<String, HashMap<String, Subscription>>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    max_delivery_count: u32,
    lock_duration: Duration,
    injected_disconnects: AtomicU32,
    unavailable: AtomicBool,
}

impl Inner {
    fn state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Backend("memory broker lock poisoned".to_string()))
    }
}

/// Broker living inside the current process
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

impl MemoryBroker {
    pub fn new(max_delivery_count: u32, lock_duration: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                max_delivery_count: max_delivery_count.max(1),
                lock_duration,
                injected_disconnects: AtomicU32::new(0),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Create a subscription so messages sent from now on are retained
    pub fn ensure_subscription(&self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.state()?;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .entry(subscription.to_string())
            .or_default();
        Ok(())
    }

    /// Make the next `n` receive calls fail as if the connection dropped
    pub fn inject_disconnects(&self, n: u32) {
        self.inner.injected_disconnects.store(n, Ordering::SeqCst);
    }

    /// Make sends fail until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages waiting (not locked) on a subscription
    pub fn pending_count(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |s| s.pending.len())
    }

    /// Bodies of dead-lettered messages on a subscription
    pub fn dead_letters(&self, topic: &str, subscription: &str) -> Vec<String> {
        self.with_subscription(topic, subscription, |s| {
            s.dead_letters.iter().map(|m| m.message.body.clone()).collect()
        })
    }

    fn with_subscription<T: Default>(
        &self,
        topic: &str,
        subscription: &str,
        f: impl FnOnce(&Subscription) -> T,
    ) -> T {
        self.inner
            .state()
            .ok()
            .and_then(|state| {
                state
                    .topics
                    .get(topic)
                    .and_then(|subs| subs.get(subscription))
                    .map(f)
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn sender(&self, topic: &str) -> Result<Arc<dyn TopicSender>, BrokerError> {
        Ok(Arc::new(MemorySender {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
        }))
    }

    async fn receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn SubscriptionReceiver>, BrokerError> {
        self.ensure_subscription(topic, subscription)?;
        Ok(Box::new(MemoryReceiver {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
        }))
    }
}

struct MemorySender {
    inner: Arc<Inner>,
    topic: String,
}

#[async_trait]
impl TopicSender for MemorySender {
    async fn send(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker marked unavailable".to_string()));
        }
        {
            let mut state = self.inner.state()?;
            if let Some(subs) = state.topics.get_mut(&self.topic) {
                for sub in subs.values_mut() {
                    sub.pending.push_back(Stored {
                        message: message.clone(),
                        delivery_count: 0,
                    });
                }
            }
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryReceiver {
    inner: Arc<Inner>,
    topic: String,
    subscription: String,
}

impl MemoryReceiver {
    fn release(&self, sub: &mut Subscription, stored: Stored) {
        if stored.delivery_count >= self.inner.max_delivery_count {
            sub.dead_letters.push(stored);
        } else {
            sub.pending.push_front(stored);
        }
    }

    fn take_batch(&self, max_count: usize) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let mut state = self.inner.state()?;
        let sub = state
            .topics
            .entry(self.topic.clone())
            .or_default()
            .entry(self.subscription.clone())
            .or_default();

        let now = Instant::now();
        let expired: Vec<String> = sub
            .locked
            .iter()
            .filter(|(_, (_, until))| *until <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some((stored, _)) = sub.locked.remove(&token) {
                self.release(sub, stored);
            }
        }

        let mut batch = Vec::new();
        while batch.len() < max_count {
            let Some(mut stored) = sub.pending.pop_front() else {
                break;
            };
            stored.delivery_count += 1;
            let lock_token = Uuid::new_v4().to_string();
            batch.push(ReceivedMessage {
                message_id: stored.message.message_id.clone(),
                body: stored.message.body.clone(),
                event_type: stored.message.event_type.clone(),
                lock_token: lock_token.clone(),
                delivery_count: stored.delivery_count,
            });
            sub.locked
                .insert(lock_token, (stored, now + self.inner.lock_duration));
        }
        Ok(batch)
    }

    fn settle(&self, message: &ReceivedMessage, abandon: bool) -> Result<(), BrokerError> {
        let mut state = self.inner.state()?;
        let sub = state
            .topics
            .get_mut(&self.topic)
            .and_then(|subs| subs.get_mut(&self.subscription))
            .ok_or_else(|| BrokerError::Backend("subscription not found".to_string()))?;

        let (stored, _) = sub
            .locked
            .remove(&message.lock_token)
            .ok_or_else(|| BrokerError::Backend("message lock lost".to_string()))?;
        if abandon {
            self.release(sub, stored);
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionReceiver for MemoryReceiver {
    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        if self
            .inner
            .injected_disconnects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Disconnected("injected disconnect".to_string()));
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_batch(max_count.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.settle(message, false)
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let result = self.settle(message, true);
        self.inner.notify.notify_waiters();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_each_subscription() {
        let broker = MemoryBroker::default();
        let a = broker.receiver("events", "a").await.unwrap();
        let b = broker.receiver("events", "b").await.unwrap();

        let sender = broker.sender("events").await.unwrap();
        sender.send(OutboundMessage::new("hello")).await.unwrap();

        let got_a = a.receive(10, Duration::from_millis(10)).await.unwrap();
        let got_b = b.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got_a.len(), 1);
        assert_eq!(got_b.len(), 1);
        assert_eq!(got_a[0].body, "hello");
    }

    #[tokio::test]
    async fn test_locked_message_hidden_until_abandoned() {
        let broker = MemoryBroker::default();
        let rx = broker.receiver("commands", "worker").await.unwrap();
        let sender = broker.sender("commands").await.unwrap();
        sender.send(OutboundMessage::new("cmd")).await.unwrap();

        let first = rx.receive(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first[0].delivery_count, 1);
        assert!(rx.receive(1, Duration::from_millis(10)).await.unwrap().is_empty());

        rx.abandon(&first[0]).await.unwrap();
        let again = rx.receive(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again[0].delivery_count, 2);
        rx.complete(&again[0]).await.unwrap();
        assert_eq!(broker.pending_count("commands", "worker"), 0);
    }

    #[tokio::test]
    async fn test_dead_lettered_after_max_deliveries() {
        let broker = MemoryBroker::new(2, Duration::from_secs(60));
        let rx = broker.receiver("commands", "worker").await.unwrap();
        let sender = broker.sender("commands").await.unwrap();
        sender.send(OutboundMessage::new("poison")).await.unwrap();

        for _ in 0..2 {
            let batch = rx.receive(1, Duration::from_millis(10)).await.unwrap();
            rx.abandon(&batch[0]).await.unwrap();
        }

        assert!(rx.receive(1, Duration::from_millis(10)).await.unwrap().is_empty());
        assert_eq!(broker.dead_letters("commands", "worker"), vec!["poison".to_string()]);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let broker = MemoryBroker::default();
        let rx = broker.receiver("events", "web").await.unwrap();
        let sender = broker.sender("events").await.unwrap();

        let waiter = tokio::spawn(async move { rx.receive(1, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.send(OutboundMessage::new("late")).await.unwrap();

        let batch = waiter.await.unwrap().unwrap();
        assert_eq!(batch[0].body, "late");
    }
}
