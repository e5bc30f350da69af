//! SQLite-backed broker shared by several processes through one file.
//!
//! `send` writes the message once and one delivery row per subscription of
//! the topic. Receivers lock deliveries by stamping a token and an expiry;
//! an expired lock makes the delivery visible again.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Broker, BrokerError, OutboundMessage, ReceivedMessage, SubscriptionReceiver, TopicSender,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    topic TEXT NOT NULL,
    name  TEXT NOT NULL,
    PRIMARY KEY (topic, name)
);
CREATE TABLE IF NOT EXISTS messages (
    message_id  TEXT PRIMARY KEY,
    topic       TEXT NOT NULL,
    body        TEXT NOT NULL,
    event_type  TEXT,
    enqueued_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS deliveries (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    topic          TEXT NOT NULL,
    subscription   TEXT NOT NULL,
    message_id     TEXT NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    locked_until   INTEGER,
    lock_token     TEXT,
    dead_lettered  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS deliveries_queue
    ON deliveries (topic, subscription, dead_lettered, seq);
"#;

/// Interval between polls while a receive call is waiting
const POLL_INTERVAL: Duration = Duration::from_millis(200);

type SharedConnection = Arc<Mutex<Connection>>;

async fn with_conn<T, F>(conn: &SharedConnection, f: F) -> Result<T, BrokerError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, BrokerError> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn
            .lock()
            .map_err(|_| BrokerError::Backend("sqlite connection lock poisoned".to_string()))?;
        f(&mut guard)
    })
    .await
    .map_err(|e| BrokerError::Backend(format!("sqlite task failed: {}", e)))?
}

/// Broker persisted in a SQLite database file
pub struct SqliteBroker {
    conn: SharedConnection,
    max_delivery_count: u32,
    lock_duration: Duration,
}

impl SqliteBroker {
    pub fn open(
        path: impl AsRef<Path>,
        max_delivery_count: u32,
        lock_duration: Duration,
    ) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BrokerError::Unavailable(format!(
                    "Failed to create broker directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn, max_delivery_count, lock_duration)
    }

    pub fn in_memory(max_delivery_count: u32, lock_duration: Duration) -> Result<Self, BrokerError> {
        Self::init(Connection::open_in_memory()?, max_delivery_count, lock_duration)
    }

    fn init(
        conn: Connection,
        max_delivery_count: u32,
        lock_duration: Duration,
    ) -> Result<Self, BrokerError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_delivery_count: max_delivery_count.max(1),
            lock_duration,
        })
    }

    /// Register a subscription so it receives messages sent from now on
    pub async fn ensure_subscription(&self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        let topic = topic.to_string();
        let subscription = subscription.to_string();
        with_conn(&self.conn, move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO subscriptions (topic, name) VALUES (?1, ?2)",
                params![topic, subscription],
            )?;
            Ok(())
        })
        .await
    }

    /// Drop deliveries of messages older than `max_age`, settled or not.
    ///
    /// Covers dead letters and subscriptions nobody drains. Locked deliveries
    /// are left alone. Returns the number of deliveries removed.
    pub async fn purge_older_than(&self, max_age: Duration) -> Result<u64, BrokerError> {
        let now = Utc::now().timestamp_millis();
        let cutoff = now - max_age.as_millis() as i64;
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute(
                "DELETE FROM deliveries
                 WHERE (locked_until IS NULL OR locked_until < ?2)
                   AND message_id IN (SELECT message_id FROM messages WHERE enqueued_at < ?1)",
                params![cutoff, now],
            )?;
            tx.execute(
                "DELETE FROM messages
                 WHERE enqueued_at < ?1
                   AND NOT EXISTS (SELECT 1 FROM deliveries d WHERE d.message_id = messages.message_id)",
                params![cutoff],
            )?;
            tx.commit()?;
            Ok(removed as u64)
        })
        .await
    }

    /// Number of dead-lettered deliveries on a subscription
    pub async fn dead_letter_count(&self, topic: &str, subscription: &str) -> Result<u64, BrokerError> {
        let topic = topic.to_string();
        let subscription = subscription.to_string();
        with_conn(&self.conn, move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM deliveries
                 WHERE topic = ?1 AND subscription = ?2 AND dead_lettered = 1",
                params![topic, subscription],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn sender(&self, topic: &str) -> Result<Arc<dyn TopicSender>, BrokerError> {
        Ok(Arc::new(SqliteSender {
            conn: Arc::clone(&self.conn),
            topic: topic.to_string(),
        }))
    }

    async fn receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn SubscriptionReceiver>, BrokerError> {
        self.ensure_subscription(topic, subscription).await?;
        Ok(Box::new(SqliteReceiver {
            conn: Arc::clone(&self.conn),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            max_delivery_count: self.max_delivery_count,
            lock_duration: self.lock_duration,
        }))
    }
}

struct SqliteSender {
    conn: SharedConnection,
    topic: String,
}

#[async_trait]
impl TopicSender for SqliteSender {
    async fn send(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let topic = self.topic.clone();
        let fanned_out = with_conn(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO messages (message_id, topic, body, event_type, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.message_id,
                    topic,
                    message.body,
                    message.event_type,
                    Utc::now().timestamp_millis()
                ],
            )?;
            let fanned_out = tx.execute(
                "INSERT INTO deliveries (topic, subscription, message_id)
                 SELECT topic, name, ?2 FROM subscriptions WHERE topic = ?1",
                params![topic, message.message_id],
            )?;
            tx.commit()?;
            Ok(fanned_out)
        })
        .await?;

        if fanned_out == 0 {
            debug!(topic = %self.topic, "Message sent to a topic with no subscriptions");
        }
        Ok(())
    }
}

struct SqliteReceiver {
    conn: SharedConnection,
    topic: String,
    subscription: String,
    max_delivery_count: u32,
    lock_duration: Duration,
}

impl SqliteReceiver {
    async fn take_batch(&self, max_count: usize) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let topic = self.topic.clone();
        let subscription = self.subscription.clone();
        let max_deliveries = i64::from(self.max_delivery_count);
        let lock_ms = self.lock_duration.as_millis() as i64;
        let limit = max_count.max(1) as i64;

        let (batch, dead_lettered) = with_conn(&self.conn, move |conn| {
            let now = Utc::now().timestamp_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let dead_lettered = tx.execute(
                "UPDATE deliveries SET dead_lettered = 1, lock_token = NULL, locked_until = NULL
                 WHERE topic = ?1 AND subscription = ?2 AND dead_lettered = 0
                   AND delivery_count >= ?3
                   AND (locked_until IS NULL OR locked_until <= ?4)",
                params![topic, subscription, max_deliveries, now],
            )?;

            let candidates: Vec<(i64, String, String, Option<String>, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT d.seq, d.message_id, m.body, m.event_type, d.delivery_count
                     FROM deliveries d JOIN messages m ON m.message_id = d.message_id
                     WHERE d.topic = ?1 AND d.subscription = ?2 AND d.dead_lettered = 0
                       AND (d.locked_until IS NULL OR d.locked_until <= ?3)
                     ORDER BY d.seq LIMIT ?4",
                )?;
                let rows = stmt.query_map(params![topic, subscription, now, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            let mut batch = Vec::with_capacity(candidates.len());
            for (seq, message_id, body, event_type, delivery_count) in candidates {
                let lock_token = Uuid::new_v4().to_string();
                tx.execute(
                    "UPDATE deliveries
                     SET delivery_count = delivery_count + 1, lock_token = ?2, locked_until = ?3
                     WHERE seq = ?1",
                    params![seq, lock_token, now + lock_ms],
                )?;
                batch.push(ReceivedMessage {
                    message_id,
                    body,
                    event_type,
                    lock_token,
                    delivery_count: (delivery_count + 1) as u32,
                });
            }
            tx.commit()?;
            Ok((batch, dead_lettered))
        })
        .await?;

        if dead_lettered > 0 {
            warn!(
                topic = %self.topic,
                subscription = %self.subscription,
                count = dead_lettered,
                "Dead-lettered messages past max delivery count"
            );
        }
        Ok(batch)
    }
}

#[async_trait]
impl SubscriptionReceiver for SqliteReceiver {
    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let batch = self.take_batch(max_count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let token = message.lock_token.clone();
        let message_id = message.message_id.clone();
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute(
                "DELETE FROM deliveries WHERE lock_token = ?1",
                params![token],
            )?;
            if removed == 0 {
                return Err(BrokerError::Backend("message lock lost".to_string()));
            }
            tx.execute(
                "DELETE FROM messages WHERE message_id = ?1
                 AND NOT EXISTS (SELECT 1 FROM deliveries WHERE message_id = ?1)",
                params![message_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let token = message.lock_token.clone();
        with_conn(&self.conn, move |conn| {
            let released = conn.execute(
                "UPDATE deliveries SET lock_token = NULL, locked_until = NULL WHERE lock_token = ?1",
                params![token],
            )?;
            if released == 0 {
                return Err(BrokerError::Backend("message lock lost".to_string()));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_receive_complete() {
        let broker = SqliteBroker::in_memory(10, Duration::from_secs(60)).unwrap();
        let rx = broker.receiver("commands", "worker").await.unwrap();
        let tx = broker.sender("commands").await.unwrap();

        tx.send(OutboundMessage::new("{}").with_event_type("publish-request"))
            .await
            .unwrap();

        let batch = rx.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type.as_deref(), Some("publish-request"));

        rx.complete(&batch[0]).await.unwrap();
        assert!(rx.receive(10, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_then_dead_letter() {
        let broker = SqliteBroker::in_memory(2, Duration::from_secs(60)).unwrap();
        let rx = broker.receiver("commands", "worker").await.unwrap();
        let tx = broker.sender("commands").await.unwrap();
        tx.send(OutboundMessage::new("poison")).await.unwrap();

        for expected in 1..=2 {
            let batch = rx.receive(1, Duration::ZERO).await.unwrap();
            assert_eq!(batch[0].delivery_count, expected);
            rx.abandon(&batch[0]).await.unwrap();
        }

        assert!(rx.receive(1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(broker.dead_letter_count("commands", "worker").await.unwrap(), 1);
    }
}
