//! SQLite-backed document store.
//!
//! Documents live in one table keyed by `(container, id)`. Each write takes
//! the next value of a sequence row inside an IMMEDIATE transaction, so the
//! sequence order is also the commit order and several worker processes can
//! share one database file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::query::TOMBSTONE_FIELD;
use super::{ChangeBatch, DocumentStore, Filter, Order, Query, StoreError, Version, Versioned};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    container TEXT NOT NULL,
    id        TEXT NOT NULL,
    body      TEXT NOT NULL,
    etag      TEXT NOT NULL,
    lsn       INTEGER NOT NULL,
    PRIMARY KEY (container, id)
);
CREATE INDEX IF NOT EXISTS documents_feed ON documents (container, lsn);
CREATE TABLE IF NOT EXISTS sequence (
    name  TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO sequence (name, value) VALUES ('lsn', 0);
"#;

/// Document store persisted in a SQLite database file
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Private store that vanishes when dropped
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = ?path, "Opened sqlite document store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file path, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {}", e)))?
    }
}

fn next_lsn(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "UPDATE sequence SET value = value + 1 WHERE name = 'lsn' RETURNING value",
        [],
        |row| row.get(0),
    )?)
}

/// Version tag: first 8 bytes of SHA-256 over sequence number and body
fn etag_for(body: &str, lsn: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lsn.to_be_bytes());
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Translate a query into a WHERE/ORDER BY clause plus its bind values
fn build_select(container: &str, query: &Query) -> (String, Vec<SqlValue>) {
    let mut sql = String::from("SELECT body FROM documents WHERE container = ?");
    let mut binds = vec![SqlValue::Text(container.to_string())];

    if !query.include_deleted {
        sql.push_str(&format!(
            " AND json_extract(body, '$.{}') IS NULL",
            TOMBSTONE_FIELD
        ));
    }

    for filter in &query.filters {
        match filter {
            Filter::Eq(field, Value::Null) => {
                sql.push_str(&format!(" AND json_type(body, '$.{}') = 'null'", field));
            }
            Filter::Eq(field, value) => {
                sql.push_str(&format!(" AND json_extract(body, '$.{}') = ?", field));
                binds.push(sql_value(value));
            }
            Filter::Missing(field) => {
                sql.push_str(&format!(" AND json_extract(body, '$.{}') IS NULL", field));
            }
        }
    }

    if let Some((ref field, order)) = query.order_by {
        let direction = match order {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };
        sql.push_str(&format!(
            " ORDER BY json_extract(body, '$.{}') {}",
            field, direction
        ));
    }

    (sql, binds)
}

fn parse_body(body: &str) -> Result<Value, StoreError> {
    serde_json::from_str(body).map_err(StoreError::from)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn read(&self, container: &str, id: &str) -> Result<Option<Versioned<Value>>, StoreError> {
        let container = container.to_string();
        let id = id.to_string();
        let row: Option<(String, String)> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body, etag FROM documents WHERE container = ?1 AND id = ?2",
                        params![container, id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(body, etag)| {
            Ok(Versioned {
                doc: parse_body(&body)?,
                version: Version(etag),
            })
        })
        .transpose()
    }

    async fn upsert(&self, container: &str, id: &str, doc: Value) -> Result<Version, StoreError> {
        let container = container.to_string();
        let id = id.to_string();
        let body = serde_json::to_string(&doc)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let lsn = next_lsn(&tx)?;
            let etag = etag_for(&body, lsn);
            tx.execute(
                "INSERT INTO documents (container, id, body, etag, lsn)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (container, id)
                 DO UPDATE SET body = excluded.body, etag = excluded.etag, lsn = excluded.lsn",
                params![container, id, body, etag, lsn],
            )?;
            tx.commit()?;
            Ok(Version(etag))
        })
        .await
    }

    async fn replace(
        &self,
        container: &str,
        id: &str,
        doc: Value,
        if_match: &Version,
    ) -> Result<Version, StoreError> {
        let container = container.to_string();
        let id = id.to_string();
        let expected = if_match.0.clone();
        let body = serde_json::to_string(&doc)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT etag FROM documents WHERE container = ?1 AND id = ?2",
                    params![container, id],
                    |row| row.get(0),
                )
                .optional()?;

            match current {
                None => return Err(StoreError::NotFound { container, id }),
                Some(ref etag) if *etag != expected => {
                    return Err(StoreError::PreconditionFailed { container, id })
                }
                Some(_) => {}
            }

            let lsn = next_lsn(&tx)?;
            let etag = etag_for(&body, lsn);
            tx.execute(
                "UPDATE documents SET body = ?3, etag = ?4, lsn = ?5
                 WHERE container = ?1 AND id = ?2",
                params![container, id, body, etag, lsn],
            )?;
            tx.commit()?;
            Ok(Version(etag))
        })
        .await
    }

    async fn query(&self, container: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        query.validate().map_err(StoreError::InvalidQuery)?;
        let (sql, binds) = build_select(container, query);
        let bodies: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(binds.iter()), |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<String>, _>>()?)
            })
            .await?;

        bodies.iter().map(|body| parse_body(body)).collect()
    }

    async fn read_changes(
        &self,
        container: &str,
        cursor: Option<&str>,
        max_items: usize,
    ) -> Result<ChangeBatch, StoreError> {
        let after = match cursor {
            Some(c) => c
                .parse::<i64>()
                .map_err(|_| StoreError::InvalidCursor(c.to_string()))?,
            None => 0,
        };
        let container = container.to_string();
        let limit = max_items.max(1) as i64;

        let rows: Vec<(String, i64)> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body, lsn FROM documents
                     WHERE container = ?1 AND lsn > ?2
                     ORDER BY lsn LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![container, after, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let next = rows
            .last()
            .map(|(_, lsn)| lsn.to_string())
            .or_else(|| cursor.map(str::to_string));
        let items = rows
            .iter()
            .map(|(body, _)| parse_body(body))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ChangeBatch { items, cursor: next })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_for_filtered_query() {
        let query = Query::new()
            .eq("trigger_id", "l-1")
            .order_by("started_at", Order::Asc);
        let (sql, binds) = build_select("runs", &query);

        assert!(sql.contains("json_extract(body, '$.deleted_at') IS NULL"));
        assert!(sql.contains("json_extract(body, '$.trigger_id') = ?"));
        assert!(sql.ends_with("ORDER BY json_extract(body, '$.started_at') ASC"));
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn test_bool_binds_as_integer() {
        assert_eq!(sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(sql_value(&json!("x")), SqlValue::Text("x".to_string()));
    }

    #[tokio::test]
    async fn test_stale_etag_is_precondition_failure() {
        let store = SqliteStore::in_memory().unwrap();
        let v1 = store.upsert("items", "a", json!({"id": "a"})).await.unwrap();
        store
            .replace("items", "a", json!({"id": "a", "n": 1}), &v1)
            .await
            .unwrap();

        let err = store
            .replace("items", "a", json!({"id": "a", "n": 2}), &v1)
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());

        let err = store
            .replace("items", "missing", json!({}), &v1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
