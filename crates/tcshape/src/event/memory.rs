//! In-memory event store.
//!
//! Used by tests and ephemeral runs. A reader-writer lock guards one
//! map from aggregate id to event sequence; reads proceed concurrently,
//! appends are exclusive.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::event::store::EventStore;

/// Event store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    streams: RwLock<HashMap<String, Vec<Event>>>,
}

impl MemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a stream (0 when absent).
    pub async fn version_of(&self, aggregate_id: &str) -> u64 {
        let streams = self.streams.read().await;
        streams.get(aggregate_id).map_or(0, |events| events.len() as u64)
    }
}

impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        aggregate_id: &str,
        events: &[Event],
        expected_version: u64,
    ) -> Result<()> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(aggregate_id.to_string()).or_default();
        let actual = stream.len() as u64;
        if actual != expected_version {
            return Err(Error::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        stream.extend_from_slice(events);
        Ok(())
    }

    async fn events(&self, aggregate_id: &str) -> Result<Vec<Event>> {
        let streams = self.streams.read().await;
        Ok(streams.get(aggregate_id).cloned().unwrap_or_default())
    }

    async fn events_from(&self, aggregate_id: &str, from_version: u64) -> Result<Vec<Event>> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(aggregate_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.version > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn all_events(&self) -> Result<Vec<Event>> {
        let streams = self.streams.read().await;
        let mut all: Vec<Event> = streams.values().flatten().cloned().collect();
        // Cross-aggregate ordering is not guaranteed; keep readback
        // stable by sorting on (stream, position).
        all.sort_by(|a, b| {
            a.aggregate_id
                .cmp(&b.aggregate_id)
                .then(a.version.cmp(&b.version))
        });
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use crate::util::{DeviceName, Handle};

    fn event(aggregate_id: &str, version: u64) -> Event {
        Event::new(
            aggregate_id,
            version,
            EventPayload::HtbQdiscCreated {
                device: DeviceName::new("eth0").unwrap(),
                handle: Handle::new(version as u16, 0),
                parent: None,
                default_class: Handle::new(1, 0x10),
                r2q: 10,
            },
        )
    }

    #[tokio::test]
    async fn append_checks_expected_version() {
        let store = MemoryEventStore::new();
        store.append("tc:eth0", &[event("tc:eth0", 1)], 0).await.unwrap();

        let err = store
            .append("tc:eth0", &[event("tc:eth0", 2)], 0)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        store.append("tc:eth0", &[event("tc:eth0", 2)], 1).await.unwrap();
        assert_eq!(store.version_of("tc:eth0").await, 2);
    }

    #[tokio::test]
    async fn tail_slice() {
        let store = MemoryEventStore::new();
        store
            .append(
                "tc:eth0",
                &[event("tc:eth0", 1), event("tc:eth0", 2), event("tc:eth0", 3)],
                0,
            )
            .await
            .unwrap();

        let tail = store.events_from("tc:eth0", 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, 2);
        assert_eq!(tail[1].version, 3);
    }

    #[tokio::test]
    async fn all_events_spans_streams() {
        let store = MemoryEventStore::new();
        store.append("tc:eth0", &[event("tc:eth0", 1)], 0).await.unwrap();
        store.append("tc:eth1", &[event("tc:eth1", 1)], 0).await.unwrap();
        assert_eq!(store.all_events().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_stream_reads_empty() {
        let store = MemoryEventStore::new();
        assert!(store.events("tc:missing").await.unwrap().is_empty());
        assert_eq!(store.version_of("tc:missing").await, 0);
    }
}
