//! The traffic control aggregate.
//!
//! One aggregate owns the full shaping state of one interface: qdiscs,
//! classes, filters, and the version counter of its event stream. Every
//! mutator follows the same shape: check preconditions against in-memory
//! state, construct an event at `version + 1`, apply it through the same
//! code path replay uses, and park it on the uncommitted list. A failed
//! precondition returns a typed error and leaves state untouched.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventPayload};
use crate::model::{
    Filter, FilterProtocol, FqCodelParams, HtbClass, HtbParams, Match, PrioParams, Qdisc,
    QdiscKind, TbfParams, qdisc::QdiscHeader,
};
use crate::util::{Bandwidth, CancelToken, DeviceName, Handle};

/// Derive the event stream id for a device.
pub fn aggregate_id_for(device: &DeviceName) -> String {
    format!("tc:{device}")
}

/// Event-sourced shaping state for one interface.
#[derive(Debug, Clone)]
pub struct TrafficControlAggregate {
    device: DeviceName,
    version: u64,
    qdiscs: HashMap<Handle, Qdisc>,
    classes: HashMap<Handle, HtbClass>,
    filters: Vec<Filter>,
    uncommitted: Vec<Event>,
}

impl TrafficControlAggregate {
    /// Create an empty aggregate for a device.
    pub fn new(device: DeviceName) -> Self {
        Self {
            device,
            version: 0,
            qdiscs: HashMap::new(),
            classes: HashMap::new(),
            filters: Vec::new(),
            uncommitted: Vec::new(),
        }
    }

    /// Rebuild an aggregate by replaying its event log.
    ///
    /// Replay applies each event through the same code path mutators
    /// use, skipping validation; afterwards the version equals the
    /// number of events applied and the uncommitted list is empty.
    pub fn load_from_history(device: DeviceName, events: &[Event]) -> Self {
        let mut aggregate = Self::new(device);
        for event in events {
            aggregate.apply(event);
        }
        debug!(
            device = %aggregate.device,
            version = aggregate.version,
            "aggregate rebuilt from history"
        );
        aggregate
    }

    /// Replay with a cancellation checkpoint between events.
    pub fn load_from_history_cancellable(
        device: DeviceName,
        events: &[Event],
        cancel: &CancelToken,
    ) -> Result<Self> {
        let mut aggregate = Self::new(device);
        for event in events {
            cancel.checkpoint()?;
            aggregate.apply(event);
        }
        Ok(aggregate)
    }

    /// The event stream id of this aggregate.
    pub fn aggregate_id(&self) -> String {
        aggregate_id_for(&self.device)
    }

    /// The interface this aggregate describes.
    pub fn device(&self) -> &DeviceName {
        &self.device
    }

    /// Number of events applied so far (committed or not).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Qdiscs by handle.
    pub fn qdiscs(&self) -> &HashMap<Handle, Qdisc> {
        &self.qdiscs
    }

    /// Classes by handle.
    pub fn classes(&self) -> &HashMap<Handle, HtbClass> {
        &self.classes
    }

    /// Filters in creation order.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Events produced but not yet persisted.
    pub fn uncommitted_events(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Forget the uncommitted suffix after a successful append.
    pub fn mark_committed(&mut self) {
        self.uncommitted.clear();
    }

    /// Observational equality: same entities and version, ignoring the
    /// uncommitted suffix.
    pub fn state_eq(&self, other: &Self) -> bool {
        self.device == other.device
            && self.version == other.version
            && self.qdiscs == other.qdiscs
            && self.classes == other.classes
            && self.filters == other.filters
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Attach an HTB qdisc.
    pub fn add_htb_qdisc(
        &mut self,
        handle: Handle,
        parent: Option<Handle>,
        default_class: Handle,
        r2q: Option<u32>,
    ) -> Result<()> {
        if parent.is_none() && !handle.is_root() {
            return Err(Error::Invariant(
                "root qdisc handle must have minor = 0".into(),
            ));
        }
        self.check_new_qdisc(handle, parent)?;

        let payload = EventPayload::HtbQdiscCreated {
            device: self.device.clone(),
            handle,
            parent,
            default_class,
            r2q: r2q.unwrap_or_else(|| HtbParams::default().r2q),
        };
        self.raise(payload);
        Ok(())
    }

    /// Attach a TBF qdisc.
    pub fn add_tbf_qdisc(
        &mut self,
        handle: Handle,
        parent: Option<Handle>,
        params: TbfParams,
    ) -> Result<()> {
        if parent.is_none() && !handle.is_root() {
            return Err(Error::Invariant(
                "root qdisc handle must have minor = 0".into(),
            ));
        }
        self.check_new_qdisc(handle, parent)?;

        let payload = EventPayload::TbfQdiscCreated {
            device: self.device.clone(),
            handle,
            parent,
            rate: params.rate,
            buffer: params.buffer,
            limit: params.limit,
            burst: params.burst,
        };
        self.raise(payload);
        Ok(())
    }

    /// Attach a PRIO qdisc.
    pub fn add_prio_qdisc(
        &mut self,
        handle: Handle,
        parent: Option<Handle>,
        params: PrioParams,
    ) -> Result<()> {
        if parent.is_none() && !handle.is_root() {
            return Err(Error::Invariant(
                "root qdisc handle must have minor = 0".into(),
            ));
        }
        params.validate()?;
        self.check_new_qdisc(handle, parent)?;

        let payload = EventPayload::PrioQdiscCreated {
            device: self.device.clone(),
            handle,
            parent,
            bands: params.bands,
            priomap: params.priomap,
        };
        self.raise(payload);
        Ok(())
    }

    /// Attach an FQ_CODEL qdisc.
    pub fn add_fq_codel_qdisc(
        &mut self,
        handle: Handle,
        parent: Option<Handle>,
        params: FqCodelParams,
    ) -> Result<()> {
        if parent.is_none() && !handle.is_root() {
            return Err(Error::Invariant(
                "root qdisc handle must have minor = 0".into(),
            ));
        }
        self.check_new_qdisc(handle, parent)?;

        let payload = EventPayload::FqCodelQdiscCreated {
            device: self.device.clone(),
            handle,
            parent,
            limit: params.limit,
            flows: params.flows,
            target_us: params.target_us,
            interval_us: params.interval_us,
            quantum: params.quantum,
            ecn: params.ecn,
        };
        self.raise(payload);
        Ok(())
    }

    /// Detach a qdisc. The qdisc must exist and have no dependants.
    pub fn delete_qdisc(&mut self, handle: Handle) -> Result<()> {
        if !self.qdiscs.contains_key(&handle) {
            return Err(Error::NotFound(format!(
                "qdisc with handle {handle} not found"
            )));
        }
        if self.classes.values().any(|c| c.parent == handle)
            || self.filters.iter().any(|f| f.parent == handle)
        {
            return Err(Error::Invariant(format!(
                "qdisc {handle} still has classes or filters attached"
            )));
        }
        self.raise(EventPayload::QdiscDeleted { handle });
        Ok(())
    }

    /// Create an HTB class beneath an HTB qdisc or class.
    pub fn add_htb_class(
        &mut self,
        parent: Handle,
        handle: Handle,
        name: &str,
        rate: Bandwidth,
        ceil: Bandwidth,
        priority: u8,
    ) -> Result<()> {
        match self.qdiscs.get(&parent) {
            Some(qdisc) => {
                if qdisc.kind() != QdiscKind::Htb {
                    return Err(Error::Invariant("parent qdisc must be HTB type".into()));
                }
            }
            None => {
                // HTB classes may also nest beneath other HTB classes.
                if !self.classes.contains_key(&parent) {
                    return Err(Error::Invariant(format!("parent {parent} does not exist")));
                }
            }
        }
        if self.classes.contains_key(&handle) {
            return Err(Error::Invariant(format!(
                "class with handle {handle} already exists"
            )));
        }
        if !ceil.is_zero() && ceil < rate {
            return Err(Error::Invariant(format!(
                "ceil ({ceil}) cannot be less than rate ({rate})"
            )));
        }

        let class = HtbClass::new(
            self.device.clone(),
            parent,
            handle,
            name,
            rate,
            ceil,
            priority,
        )?;
        self.raise(EventPayload::HtbClassCreated { class });
        Ok(())
    }

    /// Change the rate/ceil of an existing class.
    pub fn change_class(&mut self, handle: Handle, rate: Bandwidth, ceil: Bandwidth) -> Result<()> {
        if !self.classes.contains_key(&handle) {
            return Err(Error::NotFound(format!(
                "class with handle {handle} not found"
            )));
        }
        if !ceil.is_zero() && ceil < rate {
            return Err(Error::Invariant(format!(
                "ceil ({ceil}) cannot be less than rate ({rate})"
            )));
        }
        if rate.is_zero() {
            return Err(Error::Validation("class rate must be non-zero".into()));
        }
        self.raise(EventPayload::ClassModified { handle, rate, ceil });
        Ok(())
    }

    /// Change the borrowing priority of an existing class.
    pub fn change_class_priority(&mut self, handle: Handle, priority: u8) -> Result<()> {
        if !self.classes.contains_key(&handle) {
            return Err(Error::NotFound(format!(
                "class with handle {handle} not found"
            )));
        }
        if priority > 7 {
            return Err(Error::Validation(format!(
                "class priority must be 0-7, got {priority}"
            )));
        }
        self.raise(EventPayload::ClassPriorityChanged { handle, priority });
        Ok(())
    }

    /// Remove a class. The class must exist and have no dependants.
    pub fn delete_class(&mut self, handle: Handle) -> Result<()> {
        if !self.classes.contains_key(&handle) {
            return Err(Error::NotFound(format!(
                "class with handle {handle} not found"
            )));
        }
        if self.classes.values().any(|c| c.parent == handle) {
            return Err(Error::Invariant(format!(
                "class {handle} still has child classes"
            )));
        }
        if self.filters.iter().any(|f| f.flow_id == handle || f.parent == handle) {
            return Err(Error::Invariant(format!(
                "class {handle} is still targeted by filters"
            )));
        }
        self.raise(EventPayload::ClassDeleted { handle });
        Ok(())
    }

    /// Attach a filter.
    pub fn add_filter(
        &mut self,
        parent: Handle,
        priority: u16,
        handle: Handle,
        flow_id: Handle,
        protocol: FilterProtocol,
        matches: Vec<Match>,
    ) -> Result<()> {
        if !self.qdiscs.contains_key(&parent) && !self.classes.contains_key(&parent) {
            return Err(Error::Invariant(format!("parent {parent} does not exist")));
        }
        if !self.classes.contains_key(&flow_id) {
            return Err(Error::Invariant(format!(
                "target class {flow_id} does not exist"
            )));
        }

        let filter = Filter::new(
            self.device.clone(),
            parent,
            priority,
            handle,
            flow_id,
            protocol,
            matches,
        )?;
        self.raise(EventPayload::FilterCreated { filter });
        Ok(())
    }

    /// Replace the match list and flow target of an existing filter.
    pub fn modify_filter(
        &mut self,
        parent: Handle,
        priority: u16,
        handle: Handle,
        flow_id: Handle,
        matches: Vec<Match>,
    ) -> Result<()> {
        if !self
            .filters
            .iter()
            .any(|f| f.locator() == (parent, priority, handle))
        {
            return Err(Error::NotFound(format!(
                "filter with parent {parent}, priority {priority}, handle {handle} not found"
            )));
        }
        if !self.classes.contains_key(&flow_id) {
            return Err(Error::Invariant(format!(
                "target class {flow_id} does not exist"
            )));
        }
        crate::model::filter::validate_matches(&matches)?;

        self.raise(EventPayload::FilterModified {
            parent,
            priority,
            handle,
            flow_id,
            matches,
        });
        Ok(())
    }

    /// Detach a filter identified by parent + priority + handle.
    pub fn delete_filter(&mut self, parent: Handle, priority: u16, handle: Handle) -> Result<()> {
        if !self
            .filters
            .iter()
            .any(|f| f.locator() == (parent, priority, handle))
        {
            return Err(Error::NotFound(format!(
                "filter with parent {parent}, priority {priority}, handle {handle} not found"
            )));
        }
        self.raise(EventPayload::FilterDeleted {
            parent,
            priority,
            handle,
        });
        Ok(())
    }

    // ========================================================================
    // Event application
    // ========================================================================

    /// Raise a freshly-validated event: apply it and park it on the
    /// uncommitted list.
    fn raise(&mut self, payload: EventPayload) {
        let event = Event::new(self.aggregate_id(), self.version + 1, payload);
        self.apply(&event);
        self.uncommitted.push(event);
    }

    /// Apply an event to state. Shared between mutators and replay;
    /// performs no validation.
    fn apply(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::HtbQdiscCreated {
                device,
                handle,
                parent,
                default_class,
                r2q,
            } => {
                self.qdiscs.insert(
                    *handle,
                    Qdisc::Htb {
                        header: QdiscHeader {
                            device: device.clone(),
                            handle: *handle,
                            parent: *parent,
                        },
                        params: HtbParams {
                            default_class: *default_class,
                            r2q: *r2q,
                        },
                    },
                );
            }
            EventPayload::TbfQdiscCreated {
                device,
                handle,
                parent,
                rate,
                buffer,
                limit,
                burst,
            } => {
                self.qdiscs.insert(
                    *handle,
                    Qdisc::Tbf {
                        header: QdiscHeader {
                            device: device.clone(),
                            handle: *handle,
                            parent: *parent,
                        },
                        params: TbfParams {
                            rate: *rate,
                            buffer: *buffer,
                            limit: *limit,
                            burst: *burst,
                        },
                    },
                );
            }
            EventPayload::PrioQdiscCreated {
                device,
                handle,
                parent,
                bands,
                priomap,
            } => {
                self.qdiscs.insert(
                    *handle,
                    Qdisc::Prio {
                        header: QdiscHeader {
                            device: device.clone(),
                            handle: *handle,
                            parent: *parent,
                        },
                        params: PrioParams {
                            bands: *bands,
                            priomap: *priomap,
                        },
                    },
                );
            }
            EventPayload::FqCodelQdiscCreated {
                device,
                handle,
                parent,
                limit,
                flows,
                target_us,
                interval_us,
                quantum,
                ecn,
            } => {
                self.qdiscs.insert(
                    *handle,
                    Qdisc::FqCodel {
                        header: QdiscHeader {
                            device: device.clone(),
                            handle: *handle,
                            parent: *parent,
                        },
                        params: FqCodelParams {
                            limit: *limit,
                            flows: *flows,
                            target_us: *target_us,
                            interval_us: *interval_us,
                            quantum: *quantum,
                            ecn: *ecn,
                        },
                    },
                );
            }
            EventPayload::QdiscDeleted { handle } => {
                self.qdiscs.remove(handle);
            }
            EventPayload::HtbClassCreated { class } => {
                self.classes.insert(class.handle, class.clone());
            }
            EventPayload::ClassModified { handle, rate, ceil } => {
                if let Some(class) = self.classes.get_mut(handle) {
                    class.reshape(*rate, *ceil);
                } else {
                    warn!(%handle, "ClassModified for unknown class ignored");
                }
            }
            EventPayload::ClassPriorityChanged { handle, priority } => {
                if let Some(class) = self.classes.get_mut(handle) {
                    // Range was validated when the event was produced.
                    class.priority = *priority;
                    class.htb_prio = *priority as u32;
                } else {
                    warn!(%handle, "ClassPriorityChanged for unknown class ignored");
                }
            }
            EventPayload::ClassDeleted { handle } => {
                self.classes.remove(handle);
            }
            EventPayload::FilterCreated { filter } => {
                self.filters.push(filter.clone());
            }
            EventPayload::FilterModified {
                parent,
                priority,
                handle,
                flow_id,
                matches,
            } => {
                if let Some(filter) = self
                    .filters
                    .iter_mut()
                    .find(|f| f.locator() == (*parent, *priority, *handle))
                {
                    filter.flow_id = *flow_id;
                    filter.matches = matches.clone();
                } else {
                    warn!(%parent, priority, %handle, "FilterModified for unknown filter ignored");
                }
            }
            EventPayload::FilterDeleted {
                parent,
                priority,
                handle,
            } => {
                self.filters
                    .retain(|f| f.locator() != (*parent, *priority, *handle));
            }
        }
        self.version = event.version;
    }

    /// Shared precondition for every qdisc creation.
    fn check_new_qdisc(&self, handle: Handle, parent: Option<Handle>) -> Result<()> {
        if self.qdiscs.contains_key(&handle) {
            return Err(Error::Invariant(format!(
                "qdisc with handle {handle} already exists"
            )));
        }
        if let Some(parent) = parent
            && !self.qdiscs.contains_key(&parent)
            && !self.classes.contains_key(&parent)
        {
            return Err(Error::Invariant(format!("parent {parent} does not exist")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate() -> TrafficControlAggregate {
        TrafficControlAggregate::new(DeviceName::new("eth0").unwrap())
    }

    fn root() -> Handle {
        Handle::new(1, 0)
    }

    #[test]
    fn root_qdisc_requires_minor_zero() {
        let mut agg = aggregate();
        let err = agg
            .add_htb_qdisc(Handle::new(1, 5), None, Handle::new(1, 0x10), None)
            .unwrap_err();
        assert_eq!(err.to_string(), "root qdisc handle must have minor = 0");
        assert_eq!(agg.version(), 0);
        assert!(agg.uncommitted_events().is_empty());
    }

    #[test]
    fn duplicate_qdisc_handle_rejected() {
        let mut agg = aggregate();
        agg.add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap();
        let err = agg
            .add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap_err();
        assert_eq!(err.to_string(), "qdisc with handle 1: already exists");
        assert_eq!(agg.version(), 1);
    }

    #[test]
    fn class_requires_htb_parent() {
        let mut agg = aggregate();
        agg.add_tbf_qdisc(root(), None, TbfParams::for_rate(Bandwidth::from_mbps(10)))
            .unwrap();
        let err = agg
            .add_htb_class(
                root(),
                Handle::new(1, 0x10),
                "web",
                Bandwidth::from_mbps(1),
                Bandwidth::from_mbps(2),
                0,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "parent qdisc must be HTB type");
    }

    #[test]
    fn class_ceil_below_rate_rejected_with_exact_message() {
        let mut agg = aggregate();
        agg.add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap();
        let err = agg
            .add_htb_class(
                root(),
                Handle::new(1, 0x10),
                "web",
                Bandwidth::from_mbps(20),
                Bandwidth::from_mbps(10),
                0,
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "ceil (10.0Mbps) cannot be less than rate (20.0Mbps)"
        );
        assert_eq!(agg.version(), 1);
    }

    #[test]
    fn filter_target_must_resolve() {
        let mut agg = aggregate();
        agg.add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap();
        let err = agg
            .add_filter(
                root(),
                100,
                Handle::new(0x800, 0x100),
                Handle::new(1, 0x99),
                FilterProtocol::Ipv4,
                vec![],
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "target class 1:99 does not exist");
        assert_eq!(agg.version(), 1);
        assert_eq!(agg.uncommitted_events().len(), 1);
    }

    #[test]
    fn delete_missing_filter_reports_locator() {
        let mut agg = aggregate();
        let err = agg
            .delete_filter(root(), 100, Handle::new(0x800, 0x100))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "filter with parent 1:, priority 100, handle 800:100 not found"
        );
    }

    #[test]
    fn nested_class_under_class_is_allowed() {
        let mut agg = aggregate();
        agg.add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap();
        agg.add_htb_class(
            root(),
            Handle::new(1, 1),
            "parent",
            Bandwidth::from_mbps(100),
            Bandwidth::from_mbps(100),
            0,
        )
        .unwrap();
        agg.add_htb_class(
            Handle::new(1, 1),
            Handle::new(1, 0x10),
            "leaf",
            Bandwidth::from_mbps(10),
            Bandwidth::from_mbps(20),
            1,
        )
        .unwrap();
        assert_eq!(agg.classes().len(), 2);
        assert_eq!(agg.version(), 3);
    }

    #[test]
    fn every_successful_mutator_appends_exactly_one_event() {
        let mut agg = aggregate();
        agg.add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap();
        assert_eq!(agg.version(), 1);
        assert_eq!(agg.uncommitted_events().len(), 1);

        agg.add_htb_class(
            root(),
            Handle::new(1, 0x10),
            "default",
            Bandwidth::from_mbps(10),
            Bandwidth::from_mbps(20),
            0,
        )
        .unwrap();
        assert_eq!(agg.version(), 2);
        assert_eq!(agg.uncommitted_events().len(), 2);
        for (index, event) in agg.uncommitted_events().iter().enumerate() {
            assert_eq!(event.version, index as u64 + 1);
        }
    }

    #[test]
    fn replay_reproduces_state() {
        let mut agg = aggregate();
        agg.add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap();
        agg.add_htb_class(
            root(),
            Handle::new(1, 0x10),
            "default",
            Bandwidth::from_mbps(10),
            Bandwidth::from_mbps(20),
            0,
        )
        .unwrap();
        agg.add_filter(
            root(),
            100,
            Handle::new(0x800, 0x64),
            Handle::new(1, 0x10),
            FilterProtocol::Ipv4,
            vec![Match::DestinationPort { port: 443 }],
        )
        .unwrap();
        agg.change_class(
            Handle::new(1, 0x10),
            Bandwidth::from_mbps(15),
            Bandwidth::from_mbps(30),
        )
        .unwrap();

        let replayed = TrafficControlAggregate::load_from_history(
            DeviceName::new("eth0").unwrap(),
            agg.uncommitted_events(),
        );
        assert!(replayed.state_eq(&agg));
        assert!(replayed.uncommitted_events().is_empty());
    }

    #[test]
    fn delete_class_guards_dependants() {
        let mut agg = aggregate();
        agg.add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap();
        agg.add_htb_class(
            root(),
            Handle::new(1, 0x10),
            "default",
            Bandwidth::from_mbps(10),
            Bandwidth::from_mbps(20),
            0,
        )
        .unwrap();
        agg.add_filter(
            root(),
            100,
            Handle::new(0x800, 0x64),
            Handle::new(1, 0x10),
            FilterProtocol::All,
            vec![],
        )
        .unwrap();

        assert!(agg.delete_class(Handle::new(1, 0x10)).is_err());
        agg.delete_filter(root(), 100, Handle::new(0x800, 0x64))
            .unwrap();
        assert!(agg.delete_class(Handle::new(1, 0x10)).is_ok());
        assert!(agg.delete_qdisc(root()).is_ok());
        assert!(agg.qdiscs().is_empty());
    }

    #[test]
    fn cancelled_replay_stops_cleanly() {
        let mut agg = aggregate();
        agg.add_htb_qdisc(root(), None, Handle::new(1, 0x10), None)
            .unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = TrafficControlAggregate::load_from_history_cancellable(
            DeviceName::new("eth0").unwrap(),
            agg.uncommitted_events(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
