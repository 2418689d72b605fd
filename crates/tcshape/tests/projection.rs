//! Fluent API through to backend operations.

use tcshape::event::MemoryEventStore;
use tcshape::netlink::filter::selector_for_matches;
use tcshape::netlink::{MemoryBackend, RecordedOp};
use tcshape::shaping::NetworkInterface;
use tcshape::util::{CancelToken, Handle};
use tcshape::Match;

#[tokio::test]
async fn declarative_config_reaches_the_backend_in_order() {
    let store = MemoryEventStore::new();
    let backend = MemoryBackend::new();

    NetworkInterface::new("eth0")
        .unwrap()
        .with_hard_limit_bandwidth("100mbps")
        .unwrap()
        .create_traffic_class("web")
        .with_guaranteed_bandwidth("40mbps")
        .unwrap()
        .with_soft_limit_bandwidth("80mbps")
        .unwrap()
        .with_priority(1)
        .for_port(5201)
        .done()
        .create_traffic_class("bulk")
        .with_guaranteed_bandwidth("20mbps")
        .unwrap()
        .with_priority(5)
        .done()
        .apply_to_backend(&store, &backend, &CancelToken::new())
        .await
        .unwrap();

    let ops = backend.recorded().await;
    // 1 qdisc + 2 classes + 1 filter (bulk has no predicates).
    assert_eq!(ops.len(), 4);

    let RecordedOp::AddQdisc(ref qdisc) = ops[0] else {
        panic!("first op must create the root qdisc");
    };
    assert_eq!(qdisc.handle(), Handle::new(1, 0));

    let class_handles: Vec<Handle> = ops[1..3]
        .iter()
        .map(|op| match op {
            RecordedOp::AddClass(class) => class.handle,
            other => panic!("expected class creation, got {other:?}"),
        })
        .collect();
    assert!(class_handles.contains(&Handle::new(1, 0x11)));
    assert!(class_handles.contains(&Handle::new(1, 0x15)));

    let RecordedOp::AddFilter { ref filter, ref police } = ops[3] else {
        panic!("last op must create the filter");
    };
    assert!(police.is_none());
    assert_eq!(filter.flow_id, Handle::new(1, 0x11));
    assert_eq!(filter.priority, 700);

    // The selector the kernel would see: one key for port 5201 in the
    // low half of the word at byte offset 22.
    let selector = selector_for_matches(&filter.matches).unwrap();
    assert_eq!(selector.nkeys(), 1);
    let key = selector.keys()[0];
    assert_eq!(key.mask, 0x0000_FFFF);
    assert_eq!(key.val, 5201);
    assert_eq!(key.off, 22);
}

#[tokio::test]
async fn combined_matches_become_one_selector_with_many_keys() {
    let matches = vec![
        Match::Protocol {
            protocol: tcshape::model::TransportProtocol::Tcp,
        },
        Match::DestinationPort { port: 443 },
        Match::SourceIp {
            cidr: tcshape::model::Cidr::parse("10.0.0.0/8").unwrap(),
        },
    ];
    let selector = selector_for_matches(&matches).unwrap();
    assert_eq!(selector.nkeys(), 3);

    let offsets: Vec<i32> = selector.keys().iter().map(|k| k.off).collect();
    assert_eq!(offsets, vec![9, 22, 12]);
}

#[tokio::test]
async fn reapplying_the_same_config_conflicts_with_existing_state() {
    let store = MemoryEventStore::new();
    let controller = NetworkInterface::new("eth0")
        .unwrap()
        .with_hard_limit_bandwidth("100mbps")
        .unwrap()
        .create_traffic_class("web")
        .with_guaranteed_bandwidth("40mbps")
        .unwrap()
        .with_priority(1)
        .done();

    controller.apply(&store).await.unwrap();
    // The second apply replays existing state and trips the duplicate
    // qdisc invariant rather than silently re-appending.
    let err = controller.apply(&store).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn police_actions_ride_along_with_filters() {
    use tcshape::model::{Filter, FilterProtocol};
    use tcshape::netlink::{ExceedAction, PoliceSpec, TcBackend};
    use tcshape::util::DeviceName;

    let backend = MemoryBackend::new();
    let filter = Filter::new(
        DeviceName::new("eth0").unwrap(),
        Handle::new(1, 0),
        100,
        Handle::new(0x800, 1),
        Handle::new(1, 0x10),
        FilterProtocol::Ipv4,
        vec![Match::DestinationPort { port: 80 }],
    )
    .unwrap();

    let mut police = PoliceSpec::new(1_250_000, 32_768);
    police.exceed_action = ExceedAction::Reclassify;
    backend.add_filter(&filter, Some(&police)).await.unwrap();

    let ops = backend.recorded().await;
    let RecordedOp::AddFilter { police: recorded, .. } = &ops[0] else {
        panic!("expected a filter op");
    };
    assert_eq!(recorded.as_ref().unwrap().exceed_action, ExceedAction::Reclassify);

    // A policer beyond the 32-bit rate space is refused before any
    // operation is recorded.
    let oversized = PoliceSpec::new(u64::from(u32::MAX) + 1, 32_768);
    assert!(oversized.validate().is_err());
}
