//! Optimistic concurrency across stores.

use tcshape::aggregate::TrafficControlAggregate;
use tcshape::event::store::save_aggregate;
use tcshape::event::{EventStore, MemoryEventStore};
use tcshape::util::{Bandwidth, DeviceName, Handle};

fn device() -> DeviceName {
    DeviceName::new("eth0").unwrap()
}

async fn load<S: EventStore>(store: &S) -> TrafficControlAggregate {
    let events = store.events("tc:eth0").await.unwrap();
    TrafficControlAggregate::load_from_history(device(), &events)
}

#[tokio::test]
async fn second_writer_at_same_version_conflicts() {
    let store = MemoryEventStore::new();

    // Seed one event so both writers start at version 1.
    let mut seed = TrafficControlAggregate::new(device());
    seed.add_htb_qdisc(Handle::new(1, 0), None, Handle::new(1, 0x10), None)
        .unwrap();
    save_aggregate(&store, &mut seed).await.unwrap();

    let mut first = load(&store).await;
    let mut second = load(&store).await;
    assert_eq!(first.version(), 1);
    assert_eq!(second.version(), 1);

    first
        .add_htb_class(
            Handle::new(1, 0),
            Handle::new(1, 0x10),
            "a",
            Bandwidth::from_mbps(10),
            Bandwidth::from_mbps(10),
            0,
        )
        .unwrap();
    second
        .add_htb_class(
            Handle::new(1, 0),
            Handle::new(1, 0x11),
            "b",
            Bandwidth::from_mbps(10),
            Bandwidth::from_mbps(10),
            1,
        )
        .unwrap();

    save_aggregate(&store, &mut first).await.unwrap();
    let err = save_aggregate(&store, &mut second).await.unwrap_err();
    assert!(err.is_conflict());

    // The loser reloads and retries cleanly.
    let mut retried = load(&store).await;
    assert_eq!(retried.version(), 2);
    retried
        .add_htb_class(
            Handle::new(1, 0),
            Handle::new(1, 0x11),
            "b",
            Bandwidth::from_mbps(10),
            Bandwidth::from_mbps(10),
            1,
        )
        .unwrap();
    save_aggregate(&store, &mut retried).await.unwrap();
    assert_eq!(load(&store).await.version(), 3);
}

#[tokio::test]
async fn saving_a_clean_aggregate_is_a_no_op() {
    let store = MemoryEventStore::new();
    let mut aggregate = load(&store).await;
    save_aggregate(&store, &mut aggregate).await.unwrap();
    assert!(store.events("tc:eth0").await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_writers_to_different_aggregates_do_not_interfere() {
    let store = MemoryEventStore::new();

    let mut eth0 = TrafficControlAggregate::new(device());
    eth0.add_htb_qdisc(Handle::new(1, 0), None, Handle::new(1, 0x10), None)
        .unwrap();
    let mut eth1 = TrafficControlAggregate::new(DeviceName::new("eth1").unwrap());
    eth1.add_htb_qdisc(Handle::new(1, 0), None, Handle::new(1, 0x10), None)
        .unwrap();

    let (a, b) = tokio::join!(
        save_aggregate(&store, &mut eth0),
        save_aggregate(&store, &mut eth1)
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(store.events("tc:eth0").await.unwrap().len(), 1);
    assert_eq!(store.events("tc:eth1").await.unwrap().len(), 1);
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use tcshape::event::SqliteEventStore;

    #[tokio::test]
    async fn sqlite_store_enforces_the_same_version_check() {
        let store = SqliteEventStore::open(":memory:").await.unwrap();

        let mut seed = TrafficControlAggregate::new(device());
        seed.add_htb_qdisc(Handle::new(1, 0), None, Handle::new(1, 0x10), None)
            .unwrap();
        save_aggregate(&store, &mut seed).await.unwrap();

        let events = store.events("tc:eth0").await.unwrap();
        let mut first = TrafficControlAggregate::load_from_history(device(), &events);
        let mut second = TrafficControlAggregate::load_from_history(device(), &events);

        first
            .add_htb_class(
                Handle::new(1, 0),
                Handle::new(1, 0x10),
                "a",
                Bandwidth::from_mbps(10),
                Bandwidth::from_mbps(10),
                0,
            )
            .unwrap();
        second
            .add_htb_class(
                Handle::new(1, 0),
                Handle::new(1, 0x11),
                "b",
                Bandwidth::from_mbps(10),
                Bandwidth::from_mbps(10),
                1,
            )
            .unwrap();

        save_aggregate(&store, &mut first).await.unwrap();
        let err = save_aggregate(&store, &mut second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn sqlite_replay_matches_in_memory_state() {
        let store = SqliteEventStore::open(":memory:").await.unwrap();

        let mut original = TrafficControlAggregate::new(device());
        original
            .add_htb_qdisc(Handle::new(1, 0), None, Handle::new(1, 0x10), None)
            .unwrap();
        original
            .add_htb_class(
                Handle::new(1, 0),
                Handle::new(1, 0x10),
                "default",
                Bandwidth::from_mbps(10),
                Bandwidth::from_mbps(20),
                0,
            )
            .unwrap();
        save_aggregate(&store, &mut original).await.unwrap();

        let events = store.events("tc:eth0").await.unwrap();
        let replayed = TrafficControlAggregate::load_from_history(device(), &events);
        assert!(replayed.state_eq(&original));
    }
}
