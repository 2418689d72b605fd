//! Event store abstraction.

use tracing::debug;

use crate::aggregate::TrafficControlAggregate;
use crate::error::Result;
use crate::event::Event;

/// An append-only event log keyed by aggregate id.
///
/// Implementations must make `append` atomic with respect to the
/// expected-version check: of two concurrent writers at the same
/// version, exactly one wins and the other observes
/// [`Error::ConcurrencyConflict`](crate::Error::ConcurrencyConflict).
pub trait EventStore: Send + Sync {
    /// Append events, failing if the stream is not at `expected_version`.
    fn append(
        &self,
        aggregate_id: &str,
        events: &[Event],
        expected_version: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// All events of one stream, in append order.
    fn events(&self, aggregate_id: &str) -> impl Future<Output = Result<Vec<Event>>> + Send;

    /// The tail of one stream, starting after `from_version`.
    fn events_from(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> impl Future<Output = Result<Vec<Event>>> + Send;

    /// Every event across all streams, for projections.
    fn all_events(&self) -> impl Future<Output = Result<Vec<Event>>> + Send;
}

/// Persist an aggregate's uncommitted events with an optimistic version
/// check, then mark them committed.
///
/// The expected version is the version the aggregate was loaded at:
/// current version minus the uncommitted suffix.
pub async fn save_aggregate<S: EventStore>(
    store: &S,
    aggregate: &mut TrafficControlAggregate,
) -> Result<()> {
    let uncommitted = aggregate.uncommitted_events();
    if uncommitted.is_empty() {
        return Ok(());
    }
    let expected_version = aggregate.version() - uncommitted.len() as u64;
    let aggregate_id = aggregate.aggregate_id();

    store
        .append(&aggregate_id, uncommitted, expected_version)
        .await?;

    debug!(
        aggregate_id = %aggregate_id,
        appended = uncommitted.len(),
        version = aggregate.version(),
        "events committed"
    );
    aggregate.mark_committed();
    Ok(())
}
