//! Traffic control backends.
//!
//! [`TcBackend`] is the seam between the domain and the kernel: the
//! Linux implementation marshals rtnetlink messages over a lazily
//! opened socket, the in-memory implementation records operations for
//! tests.

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use super::builder::MessageBuilder;
use super::class::write_htb_class_options;
use super::connection::{Connection, ack_request, create_request, dump_request, ifname_to_index};
use super::filter::{U32FilterSpec, write_u32_options};
use super::message::NlMsgType;
use super::netem::NetemOptions;
use super::police::PoliceSpec;
use super::qdisc::write_qdisc_options;
use super::readback::{ClassInfo, FilterInfo, QdiscInfo, parse_class, parse_filter, parse_qdisc};
use super::types::{TcMsg, TcaAttr, tc_handle};
use crate::error::{Error, Result};
use crate::model::{Filter, HtbClass, Qdisc};
use crate::util::{DeviceName, Handle};

/// Operations the projection needs from a kernel (or kernel stand-in).
pub trait TcBackend: Send + Sync {
    /// Create a qdisc.
    fn add_qdisc(&self, qdisc: &Qdisc) -> impl Future<Output = Result<()>> + Send;

    /// Create an HTB class.
    fn add_class(&self, class: &HtbClass) -> impl Future<Output = Result<()>> + Send;

    /// Create a u32 filter, optionally with a police action.
    fn add_filter(
        &self,
        filter: &Filter,
        police: Option<&PoliceSpec>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a qdisc by handle.
    fn del_qdisc(
        &self,
        device: &DeviceName,
        handle: Handle,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a class by handle.
    fn del_class(
        &self,
        device: &DeviceName,
        handle: Handle,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a filter by parent, priority, and handle.
    fn del_filter(
        &self,
        device: &DeviceName,
        parent: Handle,
        priority: u16,
        handle: Handle,
    ) -> impl Future<Output = Result<()>> + Send;

    /// List qdiscs on a device.
    fn qdiscs(&self, device: &DeviceName) -> impl Future<Output = Result<Vec<QdiscInfo>>> + Send;

    /// List classes on a device.
    fn classes(&self, device: &DeviceName) -> impl Future<Output = Result<Vec<ClassInfo>>> + Send;

    /// List filters on a device.
    fn filters(&self, device: &DeviceName) -> impl Future<Output = Result<Vec<FilterInfo>>> + Send;
}

// ============================================================================
// Linux backend
// ============================================================================

/// Backend that talks rtnetlink to the running kernel.
///
/// The socket opens lazily on first use and closes when the backend is
/// dropped.
#[derive(Default)]
pub struct LinuxBackend {
    connection: OnceCell<Connection>,
}

impl LinuxBackend {
    /// Create a backend. No socket is opened until the first operation.
    pub fn new() -> Self {
        Self::default()
    }

    async fn conn(&self) -> Result<&Connection> {
        self.connection.get_or_try_init(Connection::new_async).await
    }

    fn parent_word(parent: Option<Handle>) -> u32 {
        match parent {
            None => tc_handle::ROOT,
            Some(handle) => handle.to_u32(),
        }
    }

    /// Create a NETEM qdisc. NETEM is marshalling-only and sits outside
    /// the event-sourced model, so it lives on the Linux backend alone.
    pub async fn add_netem_qdisc(
        &self,
        device: &DeviceName,
        handle: Handle,
        parent: Option<Handle>,
        options: &NetemOptions,
    ) -> Result<()> {
        let ifindex = ifname_to_index(device.as_str())?;
        let tcmsg = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(handle.to_u32())
            .with_parent(Self::parent_word(parent));

        let mut builder = create_request(NlMsgType::RTM_NEWQDISC);
        builder.append(&tcmsg);
        builder.append_attr_str(TcaAttr::Kind as u16, "netem");
        let nest = builder.nest_start(TcaAttr::Options as u16);
        options.write_options(&mut builder);
        builder.nest_end(nest);

        self.conn()
            .await?
            .request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("adding netem qdisc {handle} on {device}")))
    }
}

impl Connection {
    /// `OnceCell::get_or_try_init` wants an async initializer.
    async fn new_async() -> Result<Self> {
        Self::new()
    }
}

impl TcBackend for LinuxBackend {
    async fn add_qdisc(&self, qdisc: &Qdisc) -> Result<()> {
        let device = qdisc.device();
        let handle = qdisc.handle();
        let ifindex = ifname_to_index(device.as_str())?;

        let tcmsg = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(handle.to_u32())
            .with_parent(Self::parent_word(qdisc.parent()));

        let mut builder = create_request(NlMsgType::RTM_NEWQDISC);
        builder.append(&tcmsg);
        builder.append_attr_str(TcaAttr::Kind as u16, qdisc.kind().as_str());
        let nest = builder.nest_start(TcaAttr::Options as u16);
        write_qdisc_options(&mut builder, qdisc);
        builder.nest_end(nest);

        debug!(%device, %handle, kind = qdisc.kind().as_str(), "adding qdisc");
        self.conn()
            .await?
            .request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("adding {} qdisc {handle} on {device}", qdisc.kind().as_str())))
    }

    async fn add_class(&self, class: &HtbClass) -> Result<()> {
        let ifindex = ifname_to_index(class.device.as_str())?;

        let tcmsg = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(class.handle.to_u32())
            .with_parent(class.parent.to_u32());

        let mut builder = create_request(NlMsgType::RTM_NEWTCLASS);
        builder.append(&tcmsg);
        builder.append_attr_str(TcaAttr::Kind as u16, "htb");
        let nest = builder.nest_start(TcaAttr::Options as u16);
        write_htb_class_options(&mut builder, class);
        builder.nest_end(nest);

        debug!(device = %class.device, handle = %class.handle, "adding htb class");
        self.conn()
            .await?
            .request_ack(builder)
            .await
            .map_err(|e| {
                e.with_context(format!(
                    "adding htb class {} on {}",
                    class.handle, class.device
                ))
            })
    }

    async fn add_filter(&self, filter: &Filter, police: Option<&PoliceSpec>) -> Result<()> {
        let ifindex = ifname_to_index(filter.device.as_str())?;

        // tcm_info = TC_H_MAKE(prio << 16, htons(protocol)): priority in
        // the high half, ether-type in network order in the low half.
        let info =
            ((filter.priority as u32) << 16) | (filter.protocol.ether_type().to_be() as u32);
        let tcmsg = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(filter.handle.to_u32())
            .with_parent(filter.parent.to_u32())
            .with_info(info);

        let mut spec = U32FilterSpec::from_matches(filter.flow_id, &filter.matches)?;
        if let Some(police) = police {
            spec = spec.with_police(police.clone());
        }

        let mut builder = create_request(NlMsgType::RTM_NEWTFILTER);
        builder.append(&tcmsg);
        builder.append_attr_str(TcaAttr::Kind as u16, "u32");
        let nest = builder.nest_start(TcaAttr::Options as u16);
        write_u32_options(&mut builder, &spec)?;
        builder.nest_end(nest);

        debug!(
            device = %filter.device,
            parent = %filter.parent,
            priority = filter.priority,
            keys = spec.selector.nkeys(),
            "adding u32 filter"
        );
        self.conn()
            .await?
            .request_ack(builder)
            .await
            .map_err(|e| {
                e.with_context(format!(
                    "adding filter at {} priority {} on {}",
                    filter.parent, filter.priority, filter.device
                ))
            })
    }

    async fn del_qdisc(&self, device: &DeviceName, handle: Handle) -> Result<()> {
        let ifindex = ifname_to_index(device.as_str())?;
        let tcmsg = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(handle.to_u32())
            .with_parent(tc_handle::ROOT);

        let mut builder = ack_request(NlMsgType::RTM_DELQDISC);
        builder.append(&tcmsg);

        match self.conn().await?.request_ack(builder).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!(
                "qdisc with handle {handle} not found on {device}"
            ))),
            Err(e) => Err(e.with_context(format!("deleting qdisc {handle} on {device}"))),
        }
    }

    async fn del_class(&self, device: &DeviceName, handle: Handle) -> Result<()> {
        let ifindex = ifname_to_index(device.as_str())?;
        let tcmsg = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(handle.to_u32());

        let mut builder = ack_request(NlMsgType::RTM_DELTCLASS);
        builder.append(&tcmsg);

        match self.conn().await?.request_ack(builder).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!(
                "class with handle {handle} not found on {device}"
            ))),
            Err(e) => Err(e.with_context(format!("deleting class {handle} on {device}"))),
        }
    }

    async fn del_filter(
        &self,
        device: &DeviceName,
        parent: Handle,
        priority: u16,
        handle: Handle,
    ) -> Result<()> {
        let ifindex = ifname_to_index(device.as_str())?;
        // Priority in the high half; a zero ether-type matches any
        // protocol on delete.
        let info = (priority as u32) << 16;
        let tcmsg = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(handle.to_u32())
            .with_parent(parent.to_u32())
            .with_info(info);

        let mut builder = ack_request(NlMsgType::RTM_DELTFILTER);
        builder.append(&tcmsg);

        match self.conn().await?.request_ack(builder).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!(
                "filter with parent {parent}, priority {priority}, handle {handle} not found"
            ))),
            Err(e) => Err(e.with_context(format!(
                "deleting filter at {parent} priority {priority} on {device}"
            ))),
        }
    }

    async fn qdiscs(&self, device: &DeviceName) -> Result<Vec<QdiscInfo>> {
        let ifindex = ifname_to_index(device.as_str())?;
        let mut builder = dump_request(NlMsgType::RTM_GETQDISC);
        builder.append(&TcMsg::new());

        let responses = self.conn().await?.request_dump(builder).await?;
        let mut infos = Vec::new();
        for payload in responses {
            let info = parse_qdisc(&payload)?;
            if info.ifindex == ifindex {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    async fn classes(&self, device: &DeviceName) -> Result<Vec<ClassInfo>> {
        let ifindex = ifname_to_index(device.as_str())?;
        let mut builder = dump_request(NlMsgType::RTM_GETTCLASS);
        builder.append(&TcMsg::new().with_ifindex(ifindex));

        let responses = self.conn().await?.request_dump(builder).await?;
        let mut infos = Vec::new();
        for payload in responses {
            let info = parse_class(&payload)?;
            if info.ifindex == ifindex {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    async fn filters(&self, device: &DeviceName) -> Result<Vec<FilterInfo>> {
        let ifindex = ifname_to_index(device.as_str())?;
        let mut builder = dump_request(NlMsgType::RTM_GETTFILTER);
        builder.append(&TcMsg::new().with_ifindex(ifindex));

        let responses = self.conn().await?.request_dump(builder).await?;
        let mut infos = Vec::new();
        for payload in responses {
            let info = parse_filter(&payload)?;
            if info.ifindex == ifindex {
                infos.push(info);
            }
        }
        Ok(infos)
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// One recorded backend operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    AddQdisc(Qdisc),
    AddClass(HtbClass),
    AddFilter {
        filter: Filter,
        police: Option<PoliceSpec>,
    },
    DelQdisc {
        device: DeviceName,
        handle: Handle,
    },
    DelClass {
        device: DeviceName,
        handle: Handle,
    },
    DelFilter {
        device: DeviceName,
        parent: Handle,
        priority: u16,
        handle: Handle,
    },
}

/// Backend that records every operation instead of talking to a kernel.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    ops: Mutex<Vec<RecordedOp>>,
}

impl MemoryBackend {
    /// Create an empty recording backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in call order.
    pub async fn recorded(&self) -> Vec<RecordedOp> {
        self.ops.lock().await.clone()
    }

    async fn record(&self, op: RecordedOp) {
        self.ops.lock().await.push(op);
    }

    fn live_qdiscs(ops: &[RecordedOp], device: &DeviceName) -> Vec<Qdisc> {
        let mut qdiscs: Vec<Qdisc> = Vec::new();
        for op in ops {
            match op {
                RecordedOp::AddQdisc(qdisc) if qdisc.device() == device => {
                    qdiscs.push(qdisc.clone());
                }
                RecordedOp::DelQdisc {
                    device: del_device,
                    handle,
                } if del_device == device => {
                    qdiscs.retain(|q| q.handle() != *handle);
                }
                _ => {}
            }
        }
        qdiscs
    }
}

impl TcBackend for MemoryBackend {
    async fn add_qdisc(&self, qdisc: &Qdisc) -> Result<()> {
        self.record(RecordedOp::AddQdisc(qdisc.clone())).await;
        Ok(())
    }

    async fn add_class(&self, class: &HtbClass) -> Result<()> {
        self.record(RecordedOp::AddClass(class.clone())).await;
        Ok(())
    }

    async fn add_filter(&self, filter: &Filter, police: Option<&PoliceSpec>) -> Result<()> {
        // Selector construction runs here too so tests exercise the
        // same validation the Linux backend applies.
        U32FilterSpec::from_matches(filter.flow_id, &filter.matches)?;
        self.record(RecordedOp::AddFilter {
            filter: filter.clone(),
            police: police.cloned(),
        })
        .await;
        Ok(())
    }

    async fn del_qdisc(&self, device: &DeviceName, handle: Handle) -> Result<()> {
        let ops = self.ops.lock().await;
        let exists = Self::live_qdiscs(&ops, device)
            .iter()
            .any(|q| q.handle() == handle);
        drop(ops);
        if !exists {
            return Err(Error::NotFound(format!(
                "qdisc with handle {handle} not found on {device}"
            )));
        }
        self.record(RecordedOp::DelQdisc {
            device: device.clone(),
            handle,
        })
        .await;
        Ok(())
    }

    async fn del_class(&self, device: &DeviceName, handle: Handle) -> Result<()> {
        let ops = self.ops.lock().await;
        let mut live = false;
        for op in ops.iter() {
            match op {
                RecordedOp::AddClass(class) if class.device == *device && class.handle == handle => {
                    live = true;
                }
                RecordedOp::DelClass {
                    device: del_device,
                    handle: del_handle,
                } if del_device == device && *del_handle == handle => {
                    live = false;
                }
                _ => {}
            }
        }
        drop(ops);
        if !live {
            return Err(Error::NotFound(format!(
                "class with handle {handle} not found on {device}"
            )));
        }
        self.record(RecordedOp::DelClass {
            device: device.clone(),
            handle,
        })
        .await;
        Ok(())
    }

    async fn del_filter(
        &self,
        device: &DeviceName,
        parent: Handle,
        priority: u16,
        handle: Handle,
    ) -> Result<()> {
        let ops = self.ops.lock().await;
        let mut live = false;
        for op in ops.iter() {
            match op {
                RecordedOp::AddFilter { filter, .. }
                    if filter.device == *device
                        && filter.locator() == (parent, priority, handle) =>
                {
                    live = true;
                }
                RecordedOp::DelFilter {
                    device: del_device,
                    parent: del_parent,
                    priority: del_priority,
                    handle: del_handle,
                } if del_device == device
                    && (*del_parent, *del_priority, *del_handle) == (parent, priority, handle) =>
                {
                    live = false;
                }
                _ => {}
            }
        }
        drop(ops);
        if !live {
            return Err(Error::NotFound(format!(
                "filter with parent {parent}, priority {priority}, handle {handle} not found"
            )));
        }
        self.record(RecordedOp::DelFilter {
            device: device.clone(),
            parent,
            priority,
            handle,
        })
        .await;
        Ok(())
    }

    async fn qdiscs(&self, device: &DeviceName) -> Result<Vec<QdiscInfo>> {
        let ops = self.ops.lock().await;
        Ok(Self::live_qdiscs(&ops, device)
            .into_iter()
            .map(|qdisc| QdiscInfo {
                ifindex: 0,
                handle: qdisc.handle(),
                parent: qdisc
                    .parent()
                    .map(Handle::to_u32)
                    .unwrap_or(tc_handle::ROOT),
                kind: qdisc.kind().as_str().to_string(),
                kind_enum: Some(qdisc.kind()),
                counters: Default::default(),
            })
            .collect())
    }

    async fn classes(&self, device: &DeviceName) -> Result<Vec<ClassInfo>> {
        let ops = self.ops.lock().await;
        Ok(ops
            .iter()
            .filter_map(|op| match op {
                RecordedOp::AddClass(class) if class.device == *device => Some(ClassInfo {
                    ifindex: 0,
                    handle: class.handle,
                    parent: class.parent.to_u32(),
                    kind: "htb".to_string(),
                    counters: Default::default(),
                }),
                _ => None,
            })
            .collect())
    }

    async fn filters(&self, device: &DeviceName) -> Result<Vec<FilterInfo>> {
        let ops = self.ops.lock().await;
        Ok(ops
            .iter()
            .filter_map(|op| match op {
                RecordedOp::AddFilter { filter, .. } if filter.device == *device => {
                    Some(FilterInfo {
                        ifindex: 0,
                        handle: filter.handle.to_u32(),
                        parent: filter.parent,
                        protocol: filter.protocol.ether_type(),
                        priority: filter.priority,
                        kind: "u32".to_string(),
                    })
                }
                _ => None,
            })
            .collect())
    }
}
