//! Declarative shaping front-end.
//!
//! The fluent API compiles class specifications into an HTB hierarchy:
//!
//! ```ignore
//! use tcshape::shaping::NetworkInterface;
//!
//! let aggregate = NetworkInterface::new("eth0")?
//!     .with_hard_limit_bandwidth("100mbps")?
//!     .create_traffic_class("web")
//!     .with_guaranteed_bandwidth("40mbps")?
//!     .with_soft_limit_bandwidth("80mbps")?
//!     .with_priority(1)
//!     .for_port(443)
//!     .done()
//!     .create_traffic_class("bulk")
//!     .with_guaranteed_bandwidth("20mbps")?
//!     .with_priority(5)
//!     .done()
//!     .apply(&store)
//!     .await?;
//! ```
//!
//! Handles are assigned deterministically: the root qdisc is `1:0` and
//! a class with priority p gets `1:(0x10 + p)`, so the declared
//! priority is readable straight out of `tc` output.

use tracing::{debug, warn};

use crate::aggregate::TrafficControlAggregate;
use crate::error::{Error, Result};
use crate::event::store::{EventStore, save_aggregate};
use crate::model::{Cidr, FilterProtocol, Match, TransportProtocol};
use crate::netlink::{Projection, TcBackend};
use crate::util::{Bandwidth, CancelToken, DeviceName, Handle};

/// Root qdisc handle of every controller-built hierarchy.
const ROOT_HANDLE: Handle = Handle::new(1, 0);

/// Base minor for priority-mapped class handles.
const CLASS_MINOR_BASE: u16 = 0x10;

/// Filter priority stride per class priority step.
const FILTER_PRIORITY_STRIDE: u16 = 100;

/// Attempts made when the event store reports a version conflict.
const CONFLICT_RETRIES: u32 = 3;

/// One declared traffic class, accumulated by the builder.
#[derive(Debug, Clone, Default)]
struct TrafficClassSpec {
    name: String,
    guaranteed: Option<Bandwidth>,
    soft_limit: Option<Bandwidth>,
    priority: Option<u8>,
    ports: Vec<u16>,
    source_ports: Vec<u16>,
    source_cidrs: Vec<Cidr>,
    destination_cidrs: Vec<Cidr>,
    protocols: Vec<TransportProtocol>,
}

impl TrafficClassSpec {
    /// Whether any packet predicate was declared.
    fn has_predicates(&self) -> bool {
        !self.ports.is_empty()
            || !self.source_ports.is_empty()
            || !self.source_cidrs.is_empty()
            || !self.destination_cidrs.is_empty()
            || !self.protocols.is_empty()
    }

    /// Matches shared by every filter of this class.
    fn base_matches(&self) -> Vec<Match> {
        let mut matches = Vec::new();
        for cidr in &self.source_cidrs {
            matches.push(Match::SourceIp { cidr: *cidr });
        }
        for cidr in &self.destination_cidrs {
            matches.push(Match::DestinationIp { cidr: *cidr });
        }
        for &port in &self.source_ports {
            matches.push(Match::SourcePort { port });
        }
        for &port in &self.ports {
            matches.push(Match::DestinationPort { port });
        }
        matches
    }
}

/// A class spec with its validated priority, rate, and ceiling.
struct ResolvedClass<'a> {
    spec: &'a TrafficClassSpec,
    priority: u8,
    guaranteed: Bandwidth,
    ceil: Bandwidth,
}

/// Controller for one interface's declarative configuration.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    device: DeviceName,
    hard_limit: Option<Bandwidth>,
    classes: Vec<TrafficClassSpec>,
}

impl NetworkInterface {
    /// Open a controller for a device.
    pub fn new(device: &str) -> Result<Self> {
        if device.is_empty() {
            return Err(Error::Validation("device required".into()));
        }
        Ok(Self {
            device: DeviceName::new(device)?,
            hard_limit: None,
            classes: Vec::new(),
        })
    }

    /// Set the interface's total bandwidth budget.
    pub fn with_hard_limit_bandwidth(mut self, bandwidth: &str) -> Result<Self> {
        self.hard_limit = Some(Bandwidth::parse(bandwidth)?);
        Ok(self)
    }

    /// Begin declaring a traffic class.
    pub fn create_traffic_class(self, name: &str) -> TrafficClassBuilder {
        TrafficClassBuilder {
            controller: self,
            spec: TrafficClassSpec {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    /// The handle a class with the given priority receives.
    pub fn class_handle_for_priority(priority: u8) -> Handle {
        Handle::new(1, CLASS_MINOR_BASE + priority as u16)
    }

    /// Validate the composite configuration, resolving each class's
    /// priority, rate, and ceiling.
    fn validate(&self) -> Result<Vec<ResolvedClass<'_>>> {
        let hard_limit = self
            .hard_limit
            .ok_or_else(|| Error::Validation("total bandwidth not set".into()))?;

        let mut seen_priorities = [false; 8];
        let mut total_guaranteed = Bandwidth::default();
        let mut resolved = Vec::with_capacity(self.classes.len());

        for spec in &self.classes {
            let Some(priority) = spec.priority else {
                return Err(Error::Validation(format!(
                    "class {:?} has no priority set",
                    spec.name
                )));
            };
            if priority > 7 {
                return Err(Error::Validation(format!(
                    "class {:?}: priority must be 0-7, got {priority}",
                    spec.name
                )));
            }
            if seen_priorities[priority as usize] {
                return Err(Error::Validation(format!(
                    "class {:?}: duplicate priority {priority}",
                    spec.name
                )));
            }
            seen_priorities[priority as usize] = true;

            let Some(guaranteed) = spec.guaranteed else {
                return Err(Error::Validation(format!(
                    "class {:?} has no guaranteed bandwidth",
                    spec.name
                )));
            };
            if let Some(soft) = spec.soft_limit
                && guaranteed > soft
            {
                return Err(Error::Validation(format!(
                    "class {:?}: guaranteed bandwidth greater than maximum ({guaranteed} > {soft})",
                    spec.name
                )));
            }
            total_guaranteed = total_guaranteed + guaranteed;

            resolved.push(ResolvedClass {
                spec,
                priority,
                guaranteed,
                // Without a declared soft limit the class may borrow up
                // to the interface budget.
                ceil: spec.soft_limit.unwrap_or(hard_limit),
            });
        }

        if total_guaranteed > hard_limit {
            return Err(Error::Validation(format!(
                "total guaranteed bandwidth exceeds hard limit ({total_guaranteed} > {hard_limit})"
            )));
        }

        Ok(resolved)
    }

    /// Compile the declaration into one aggregate-mutation batch.
    fn compile(&self, aggregate: &mut TrafficControlAggregate) -> Result<()> {
        let resolved = self.validate()?;

        // Unclassified traffic falls through to the lowest-precedence
        // class (numerically highest priority).
        let default_class = resolved
            .iter()
            .map(|c| c.priority)
            .max()
            .map(Self::class_handle_for_priority)
            .unwrap_or(ROOT_HANDLE);

        aggregate.add_htb_qdisc(ROOT_HANDLE, None, default_class, None)?;

        for class in &resolved {
            aggregate.add_htb_class(
                ROOT_HANDLE,
                Self::class_handle_for_priority(class.priority),
                &class.spec.name,
                class.guaranteed,
                class.ceil,
                class.priority,
            )?;
        }

        for class in &resolved {
            if !class.spec.has_predicates() {
                continue;
            }
            let class_handle = Self::class_handle_for_priority(class.priority);
            // Higher class priority wins classification: numerically
            // lower filter priority matches first.
            let filter_priority = FILTER_PRIORITY_STRIDE * (8 - class.priority as u16);

            let base = class.spec.base_matches();
            let match_sets: Vec<Vec<Match>> = if class.spec.protocols.is_empty() {
                vec![base]
            } else {
                // One filter per transport protocol; matches AND within
                // a filter, protocols OR across filters.
                class
                    .spec
                    .protocols
                    .iter()
                    .map(|&protocol| {
                        let mut matches = base.clone();
                        matches.push(Match::Protocol { protocol });
                        matches
                    })
                    .collect()
            };

            for (index, matches) in match_sets.into_iter().enumerate() {
                // Offset within the class's stride keeps handles unique
                // across the controller's filters.
                let filter_handle = Handle::new(0x800, filter_priority + index as u16);
                aggregate.add_filter(
                    ROOT_HANDLE,
                    filter_priority,
                    filter_handle,
                    class_handle,
                    FilterProtocol::Ipv4,
                    matches,
                )?;
            }
        }

        Ok(())
    }

    /// Validate, assign handles, and persist the configuration as
    /// events. Retries a concurrency conflict up to three times with
    /// linear backoff, reloading the aggregate each attempt.
    pub async fn apply<S: EventStore>(&self, store: &S) -> Result<TrafficControlAggregate> {
        let mut attempt = 1;
        loop {
            let events = store
                .events(&crate::aggregate::aggregate_id_for(&self.device))
                .await?;
            let mut aggregate =
                TrafficControlAggregate::load_from_history(self.device.clone(), &events);

            self.compile(&mut aggregate)?;

            match save_aggregate(store, &mut aggregate).await {
                Ok(()) => {
                    debug!(device = %self.device, version = aggregate.version(), "shaping applied");
                    return Ok(aggregate);
                }
                Err(err) if err.is_conflict() && attempt < CONFLICT_RETRIES => {
                    warn!(device = %self.device, attempt, "version conflict, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// [`apply`](Self::apply), then project the resulting state onto a
    /// backend.
    pub async fn apply_to_backend<S, B>(
        &self,
        store: &S,
        backend: &B,
        cancel: &CancelToken,
    ) -> Result<TrafficControlAggregate>
    where
        S: EventStore,
        B: TcBackend,
    {
        let aggregate = self.apply(store).await?;
        Projection::new(backend).sync(&aggregate, cancel).await?;
        Ok(aggregate)
    }
}

/// Builder for one traffic class.
#[derive(Debug, Clone)]
pub struct TrafficClassBuilder {
    controller: NetworkInterface,
    spec: TrafficClassSpec,
}

impl TrafficClassBuilder {
    /// Set the guaranteed rate of the class.
    pub fn with_guaranteed_bandwidth(mut self, bandwidth: &str) -> Result<Self> {
        self.spec.guaranteed = Some(Bandwidth::parse(bandwidth)?);
        Ok(self)
    }

    /// Set the ceiling the class may borrow up to.
    pub fn with_soft_limit_bandwidth(mut self, bandwidth: &str) -> Result<Self> {
        self.spec.soft_limit = Some(Bandwidth::parse(bandwidth)?);
        Ok(self)
    }

    /// Set the class priority (0 = highest).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.spec.priority = Some(priority);
        self
    }

    /// Steer traffic to a destination port into this class.
    pub fn for_port(mut self, port: u16) -> Self {
        self.spec.ports.push(port);
        self
    }

    /// Steer traffic from a source port into this class.
    pub fn for_source_port(mut self, port: u16) -> Self {
        self.spec.source_ports.push(port);
        self
    }

    /// Steer traffic from the given source networks into this class.
    pub fn for_source_ips(mut self, cidrs: &[&str]) -> Result<Self> {
        for cidr in cidrs {
            self.spec.source_cidrs.push(Cidr::parse(cidr)?);
        }
        Ok(self)
    }

    /// Steer traffic to the given destination networks into this class.
    pub fn for_destination_ips(mut self, cidrs: &[&str]) -> Result<Self> {
        for cidr in cidrs {
            self.spec.destination_cidrs.push(Cidr::parse(cidr)?);
        }
        Ok(self)
    }

    /// Steer the given transport protocols into this class. One filter
    /// is created per protocol.
    pub fn for_protocols(mut self, protocols: &[&str]) -> Result<Self> {
        for protocol in protocols {
            self.spec.protocols.push(TransportProtocol::parse(protocol)?);
        }
        Ok(self)
    }

    /// Commit the class into the controller.
    pub fn done(mut self) -> NetworkInterface {
        self.controller.classes.push(self.spec);
        self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemoryEventStore;

    fn two_class_controller() -> NetworkInterface {
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
            .for_port(443)
            .done()
            .create_traffic_class("bulk")
            .with_guaranteed_bandwidth("20mbps")
            .unwrap()
            .with_priority(5)
            .done()
    }

    #[test]
    fn priority_maps_to_handle_minor() {
        assert_eq!(
            NetworkInterface::class_handle_for_priority(0),
            Handle::new(1, 0x10)
        );
        assert_eq!(
            NetworkInterface::class_handle_for_priority(7),
            Handle::new(1, 0x17)
        );
    }

    #[tokio::test]
    async fn apply_builds_hierarchy_with_mapped_handles() {
        let store = MemoryEventStore::new();
        let aggregate = two_class_controller().apply(&store).await.unwrap();

        // Root qdisc + two classes + one filter.
        assert_eq!(aggregate.version(), 4);
        assert!(aggregate.qdiscs().contains_key(&Handle::new(1, 0)));
        assert!(aggregate.classes().contains_key(&Handle::new(1, 0x11)));
        assert!(aggregate.classes().contains_key(&Handle::new(1, 0x15)));

        let web = &aggregate.classes()[&Handle::new(1, 0x11)];
        assert_eq!(web.rate, Bandwidth::from_mbps(40));
        assert_eq!(web.ceil, Bandwidth::from_mbps(80));

        // Bulk declared no soft limit: it may borrow to the hard limit.
        let bulk = &aggregate.classes()[&Handle::new(1, 0x15)];
        assert_eq!(bulk.ceil, Bandwidth::from_mbps(100));

        // Filter priority encodes class precedence: 100 * (8 - 1).
        let filter = &aggregate.filters()[0];
        assert_eq!(filter.priority, 700);
        assert_eq!(filter.flow_id, Handle::new(1, 0x11));
        assert_eq!(filter.matches, vec![Match::DestinationPort { port: 443 }]);
    }

    #[tokio::test]
    async fn over_allocation_fails() {
        let store = MemoryEventStore::new();
        let controller = NetworkInterface::new("eth0")
            .unwrap()
            .with_hard_limit_bandwidth("100mbps")
            .unwrap()
            .create_traffic_class("a")
            .with_guaranteed_bandwidth("60mbps")
            .unwrap()
            .with_priority(0)
            .done()
            .create_traffic_class("b")
            .with_guaranteed_bandwidth("60mbps")
            .unwrap()
            .with_priority(1)
            .done();

        let err = controller.apply(&store).await.unwrap_err();
        assert!(err.to_string().contains("total guaranteed bandwidth"));
        // Nothing was persisted.
        assert!(store.events("tc:eth0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn guaranteed_above_soft_limit_fails() {
        let store = MemoryEventStore::new();
        let controller = NetworkInterface::new("eth0")
            .unwrap()
            .with_hard_limit_bandwidth("100mbps")
            .unwrap()
            .create_traffic_class("a")
            .with_guaranteed_bandwidth("50mbps")
            .unwrap()
            .with_soft_limit_bandwidth("40mbps")
            .unwrap()
            .with_priority(0)
            .done();

        let err = controller.apply(&store).await.unwrap_err();
        assert!(err.to_string().contains("guaranteed bandwidth greater than maximum"));
    }

    #[tokio::test]
    async fn duplicate_priorities_fail() {
        let store = MemoryEventStore::new();
        let controller = NetworkInterface::new("eth0")
            .unwrap()
            .with_hard_limit_bandwidth("100mbps")
            .unwrap()
            .create_traffic_class("a")
            .with_guaranteed_bandwidth("10mbps")
            .unwrap()
            .with_priority(3)
            .done()
            .create_traffic_class("b")
            .with_guaranteed_bandwidth("10mbps")
            .unwrap()
            .with_priority(3)
            .done();

        let err = controller.apply(&store).await.unwrap_err();
        assert!(err.to_string().contains("duplicate priority"));
    }

    #[tokio::test]
    async fn missing_hard_limit_fails() {
        let store = MemoryEventStore::new();
        let controller = NetworkInterface::new("eth0")
            .unwrap()
            .create_traffic_class("a")
            .with_guaranteed_bandwidth("10mbps")
            .unwrap()
            .with_priority(0)
            .done();
        let err = controller.apply(&store).await.unwrap_err();
        assert!(err.to_string().contains("total bandwidth not set"));
    }

    #[test]
    fn empty_device_is_rejected_up_front() {
        let err = NetworkInterface::new("").unwrap_err();
        assert!(err.to_string().contains("device required"));
    }

    #[tokio::test]
    async fn protocols_fan_out_to_one_filter_each() {
        let store = MemoryEventStore::new();
        let aggregate = NetworkInterface::new("eth0")
            .unwrap()
            .with_hard_limit_bandwidth("100mbps")
            .unwrap()
            .create_traffic_class("voip")
            .with_guaranteed_bandwidth("10mbps")
            .unwrap()
            .with_priority(0)
            .for_port(5060)
            .for_protocols(&["udp", "tcp"])
            .unwrap()
            .done()
            .apply(&store)
            .await
            .unwrap();

        let filters = aggregate.filters();
        assert_eq!(filters.len(), 2);
        // Both share the class priority's filter precedence but carry
        // distinct handles.
        assert_eq!(filters[0].priority, 800);
        assert_eq!(filters[1].priority, 800);
        assert_ne!(filters[0].handle, filters[1].handle);
        assert!(filters[0].matches.contains(&Match::Protocol {
            protocol: TransportProtocol::Udp
        }));
    }
}
