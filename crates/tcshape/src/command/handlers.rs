//! Command handlers.
//!
//! Every handler follows the same sequence: parse string-typed fields
//! into value objects, load the device's aggregate from the event store,
//! call the matching mutator, save. All business rules live in the
//! aggregate; handlers only translate and orchestrate.

use tracing::debug;

use super::{
    AddAdvancedFilter, AddFilter, AddFqCodelQdisc, AddHtbClass, AddHtbQdisc, AddPrioQdisc,
    AddTbfQdisc, ChangeClass, ChangeClassPriority, DeleteClass, DeleteFilter, DeleteQdisc,
    ModifyFilter, parse_bandwidth_field, parse_device, parse_filter_protocol, parse_handle_field,
    parse_optional_parent,
};
use crate::aggregate::{TrafficControlAggregate, aggregate_id_for};
use crate::error::Result;
use crate::event::store::{EventStore, save_aggregate};
use crate::model::{FqCodelParams, PrioParams, TbfParams};
use crate::util::DeviceName;

/// Handlers for every command kind, bound to one event store.
pub struct CommandService<'a, S> {
    store: &'a S,
}

impl<'a, S: EventStore> CommandService<'a, S> {
    /// Bind handlers to a store.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Load the aggregate for a device by replaying its history.
    pub async fn load(&self, device: &DeviceName) -> Result<TrafficControlAggregate> {
        let events = self.store.events(&aggregate_id_for(device)).await?;
        Ok(TrafficControlAggregate::load_from_history(
            device.clone(),
            &events,
        ))
    }

    async fn save(&self, aggregate: &mut TrafficControlAggregate) -> Result<()> {
        save_aggregate(self.store, aggregate).await
    }

    /// Handle [`AddHtbQdisc`].
    pub async fn add_htb_qdisc(&self, cmd: AddHtbQdisc) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let parent = parse_optional_parent(cmd.parent.as_deref())?;
        let default_class = parse_handle_field("default", &cmd.default_class)?;

        let mut aggregate = self.load(&device).await?;
        aggregate.add_htb_qdisc(handle, parent, default_class, cmd.r2q)?;
        debug!(%device, %handle, "htb qdisc created");
        self.save(&mut aggregate).await
    }

    /// Handle [`AddTbfQdisc`].
    pub async fn add_tbf_qdisc(&self, cmd: AddTbfQdisc) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let parent = parse_optional_parent(cmd.parent.as_deref())?;
        let rate = parse_bandwidth_field("rate", &cmd.rate)?;

        let mut params = TbfParams::for_rate(rate);
        if let Some(buffer) = cmd.buffer {
            params.buffer = buffer;
        }
        if let Some(limit) = cmd.limit {
            params.limit = limit;
        }
        if let Some(burst) = cmd.burst {
            params.burst = burst;
        }

        let mut aggregate = self.load(&device).await?;
        aggregate.add_tbf_qdisc(handle, parent, params)?;
        debug!(%device, %handle, "tbf qdisc created");
        self.save(&mut aggregate).await
    }

    /// Handle [`AddPrioQdisc`].
    pub async fn add_prio_qdisc(&self, cmd: AddPrioQdisc) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let parent = parse_optional_parent(cmd.parent.as_deref())?;

        let mut params = PrioParams::default();
        if let Some(bands) = cmd.bands {
            params.bands = bands;
        }
        if let Some(priomap) = cmd.priomap {
            params.priomap = priomap;
        }

        let mut aggregate = self.load(&device).await?;
        aggregate.add_prio_qdisc(handle, parent, params)?;
        debug!(%device, %handle, "prio qdisc created");
        self.save(&mut aggregate).await
    }

    /// Handle [`AddFqCodelQdisc`].
    pub async fn add_fq_codel_qdisc(&self, cmd: AddFqCodelQdisc) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let parent = parse_optional_parent(cmd.parent.as_deref())?;

        let defaults = FqCodelParams::default();
        let params = FqCodelParams {
            limit: cmd.limit.unwrap_or(defaults.limit),
            flows: cmd.flows.unwrap_or(defaults.flows),
            target_us: cmd.target_us.unwrap_or(defaults.target_us),
            interval_us: cmd.interval_us.unwrap_or(defaults.interval_us),
            quantum: cmd.quantum.unwrap_or(defaults.quantum),
            ecn: cmd.ecn.unwrap_or(defaults.ecn),
        };

        let mut aggregate = self.load(&device).await?;
        aggregate.add_fq_codel_qdisc(handle, parent, params)?;
        debug!(%device, %handle, "fq_codel qdisc created");
        self.save(&mut aggregate).await
    }

    /// Handle [`DeleteQdisc`].
    pub async fn delete_qdisc(&self, cmd: DeleteQdisc) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;

        let mut aggregate = self.load(&device).await?;
        aggregate.delete_qdisc(handle)?;
        debug!(%device, %handle, "qdisc deleted");
        self.save(&mut aggregate).await
    }

    /// Handle [`AddHtbClass`].
    pub async fn add_htb_class(&self, cmd: AddHtbClass) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let parent = parse_handle_field("parent", &cmd.parent)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let rate = parse_bandwidth_field("rate", &cmd.rate)?;
        let ceil = parse_bandwidth_field("ceil", &cmd.ceil)?;

        let mut aggregate = self.load(&device).await?;
        aggregate.add_htb_class(
            parent,
            handle,
            &cmd.name,
            rate,
            ceil,
            cmd.priority.unwrap_or(0),
        )?;
        debug!(%device, %handle, name = %cmd.name, "htb class created");
        self.save(&mut aggregate).await
    }

    /// Handle [`ChangeClass`].
    pub async fn change_class(&self, cmd: ChangeClass) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let rate = parse_bandwidth_field("rate", &cmd.rate)?;
        let ceil = parse_bandwidth_field("ceil", &cmd.ceil)?;

        let mut aggregate = self.load(&device).await?;
        aggregate.change_class(handle, rate, ceil)?;
        self.save(&mut aggregate).await
    }

    /// Handle [`ChangeClassPriority`].
    pub async fn change_class_priority(&self, cmd: ChangeClassPriority) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;

        let mut aggregate = self.load(&device).await?;
        aggregate.change_class_priority(handle, cmd.priority)?;
        self.save(&mut aggregate).await
    }

    /// Handle [`DeleteClass`].
    pub async fn delete_class(&self, cmd: DeleteClass) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;

        let mut aggregate = self.load(&device).await?;
        aggregate.delete_class(handle)?;
        self.save(&mut aggregate).await
    }

    /// Handle [`AddFilter`].
    pub async fn add_filter(&self, cmd: AddFilter) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let parent = parse_handle_field("parent", &cmd.parent)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let flow_id = parse_handle_field("flowid", &cmd.flow_id)?;
        let protocol = parse_filter_protocol(cmd.protocol.as_deref())?;

        let mut aggregate = self.load(&device).await?;
        aggregate.add_filter(parent, cmd.priority, handle, flow_id, protocol, cmd.matches)?;
        debug!(%device, %parent, priority = cmd.priority, "filter created");
        self.save(&mut aggregate).await
    }

    /// Handle [`AddAdvancedFilter`]: structured options become a match
    /// list. Unparseable options fail the command instead of being
    /// silently dropped.
    pub async fn add_advanced_filter(&self, cmd: AddAdvancedFilter) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let parent = parse_handle_field("parent", &cmd.parent)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let flow_id = parse_handle_field("flowid", &cmd.flow_id)?;
        let protocol = parse_filter_protocol(cmd.protocol.as_deref())?;
        let matches = cmd.options.into_matches()?;

        let mut aggregate = self.load(&device).await?;
        aggregate.add_filter(parent, cmd.priority, handle, flow_id, protocol, matches)?;
        debug!(%device, %parent, priority = cmd.priority, "advanced filter created");
        self.save(&mut aggregate).await
    }

    /// Handle [`ModifyFilter`].
    pub async fn modify_filter(&self, cmd: ModifyFilter) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let parent = parse_handle_field("parent", &cmd.parent)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;
        let flow_id = parse_handle_field("flowid", &cmd.flow_id)?;

        let mut aggregate = self.load(&device).await?;
        aggregate.modify_filter(parent, cmd.priority, handle, flow_id, cmd.matches)?;
        self.save(&mut aggregate).await
    }

    /// Handle [`DeleteFilter`].
    pub async fn delete_filter(&self, cmd: DeleteFilter) -> Result<()> {
        let device = parse_device(&cmd.device)?;
        let parent = parse_handle_field("parent", &cmd.parent)?;
        let handle = parse_handle_field("handle", &cmd.handle)?;

        let mut aggregate = self.load(&device).await?;
        aggregate.delete_filter(parent, cmd.priority, handle)?;
        self.save(&mut aggregate).await
    }
}
