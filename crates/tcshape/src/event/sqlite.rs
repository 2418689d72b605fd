//! SQLite-backed event store.
//!
//! One row per event. The `(aggregate_id, version)` primary key supplies
//! the optimistic-concurrency check: a writer whose expected version has
//! been overtaken violates the key and the transaction rolls back.

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::store::EventStore;
use crate::event::{Event, EventPayload};

/// Event store backed by a SQLite database file.
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Open (and create, if necessary) a store at the given path. Use
    /// `":memory:"` for an ephemeral database.
    pub async fn open(path: &str) -> Result<Self> {
        info!(path = %path, "opening event store");
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // One connection per store instance; concurrent instances rely
        // on database-level locking.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        debug!("running event store migrations");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                aggregate_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                occurred_at INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (aggregate_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current version of a stream (0 when absent).
    pub async fn version_of(&self, aggregate_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS version FROM events WHERE aggregate_id = ?",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await?;
        let version: i64 = row.get("version");
        Ok(version as u64)
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
        let aggregate_id: String = row.get("aggregate_id");
        let version: i64 = row.get("version");
        let occurred_at: i64 = row.get("occurred_at");
        let payload_blob: Vec<u8> = row.get("payload");
        let payload: EventPayload = serde_json::from_slice(&payload_blob)?;
        Ok(Event {
            aggregate_id,
            version: version as u64,
            occurred_at,
            payload,
        })
    }
}

impl EventStore for SqliteEventStore {
    async fn append(
        &self,
        aggregate_id: &str,
        events: &[Event],
        expected_version: u64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS version FROM events WHERE aggregate_id = ?",
        )
        .bind(aggregate_id)
        .fetch_one(&mut *tx)
        .await?;
        let actual: i64 = row.get("version");
        if actual as u64 != expected_version {
            return Err(Error::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual: actual as u64,
            });
        }

        for event in events {
            let payload = serde_json::to_vec(&event.payload)?;
            let inserted = sqlx::query(
                "INSERT INTO events (aggregate_id, version, event_type, occurred_at, payload) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(aggregate_id)
            .bind(event.version as i64)
            .bind(event.event_type())
            .bind(event.occurred_at)
            .bind(payload)
            .execute(&mut *tx)
            .await;

            // A unique-key violation means another writer got there
            // between our check and the insert.
            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    return Err(Error::ConcurrencyConflict {
                        aggregate_id: aggregate_id.to_string(),
                        expected: expected_version,
                        actual: event.version,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn events(&self, aggregate_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT aggregate_id, version, occurred_at, payload FROM events \
             WHERE aggregate_id = ? ORDER BY version",
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn events_from(&self, aggregate_id: &str, from_version: u64) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT aggregate_id, version, occurred_at, payload FROM events \
             WHERE aggregate_id = ? AND version > ? ORDER BY version",
        )
        .bind(aggregate_id)
        .bind(from_version as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn all_events(&self) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT aggregate_id, version, occurred_at, payload FROM events \
             ORDER BY aggregate_id, version",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{DeviceName, Handle};

    fn event(version: u64) -> Event {
        Event::new(
            "tc:eth0",
            version,
            EventPayload::HtbQdiscCreated {
                device: DeviceName::new("eth0").unwrap(),
                handle: Handle::new(1, 0),
                parent: None,
                default_class: Handle::new(1, 0x10),
                r2q: 10,
            },
        )
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let store = SqliteEventStore::open(":memory:").await.unwrap();
        store.append("tc:eth0", &[event(1), event(2)], 0).await.unwrap();

        let events = store.events("tc:eth0").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[0].event_type(), "HTBQdiscCreated");
        assert_eq!(store.version_of("tc:eth0").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn version_check_rejects_stale_writer() {
        let store = SqliteEventStore::open(":memory:").await.unwrap();
        store.append("tc:eth0", &[event(1)], 0).await.unwrap();

        let err = store.append("tc:eth0", &[event(1)], 0).await.unwrap_err();
        assert!(err.is_conflict());
        // Losing writer left nothing behind.
        assert_eq!(store.events("tc:eth0").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tail_and_cross_stream_reads() {
        let store = SqliteEventStore::open(":memory:").await.unwrap();
        store.append("tc:eth0", &[event(1), event(2)], 0).await.unwrap();

        let mut other = event(1);
        other.aggregate_id = "tc:eth1".into();
        store.append("tc:eth1", &[other], 0).await.unwrap();

        assert_eq!(store.events_from("tc:eth0", 1).await.unwrap().len(), 1);
        assert_eq!(store.all_events().await.unwrap().len(), 3);
    }
}
