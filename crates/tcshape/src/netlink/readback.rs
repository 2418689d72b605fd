//! Kernel readback: reconstructing domain records from dump responses.

use super::attr::{AttrIter, get};
use super::types::{GnetStatsBasic, GnetStatsQueue, TcMsg, TcStats, TcaAttr, stats2};
use crate::error::Result;
use crate::model::QdiscKind;
use crate::util::Handle;

/// Counters common to qdiscs, classes, and filters. Values the kernel
/// did not report read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcCounters {
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
    pub overlimits: u64,
    pub backlog: u64,
}

/// One qdisc as reported by the kernel.
#[derive(Debug, Clone)]
pub struct QdiscInfo {
    /// Interface index the qdisc is attached to.
    pub ifindex: i32,
    /// Qdisc handle.
    pub handle: Handle,
    /// Parent handle word (may be the root sentinel).
    pub parent: u32,
    /// Kernel type string ("htb", "fq_codel", ...).
    pub kind: String,
    /// The enumeration value, when the kind is known.
    pub kind_enum: Option<QdiscKind>,
    /// Traffic counters.
    pub counters: TcCounters,
}

/// One class as reported by the kernel.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub ifindex: i32,
    pub handle: Handle,
    pub parent: u32,
    pub kind: String,
    pub counters: TcCounters,
}

/// One filter as reported by the kernel.
#[derive(Debug, Clone)]
pub struct FilterInfo {
    pub ifindex: i32,
    pub handle: u32,
    pub parent: Handle,
    /// Ether-type from tcm_info.
    pub protocol: u16,
    /// Priority from tcm_info.
    pub priority: u16,
    pub kind: String,
}

/// Shared parse of a tcmsg + attribute payload.
struct RawTcMessage {
    header: TcMsg,
    kind: String,
    counters: TcCounters,
}

fn parse_raw(payload: &[u8]) -> Result<RawTcMessage> {
    let header = *TcMsg::from_bytes(payload)?;
    let mut kind = String::new();
    let mut counters = TcCounters::default();

    for (attr_type, data) in AttrIter::new(&payload[TcMsg::SIZE..]) {
        match attr_type {
            t if t == TcaAttr::Kind as u16 => {
                kind = get::string(data).unwrap_or_default();
            }
            t if t == TcaAttr::Stats2 as u16 => {
                for (nested_type, nested) in AttrIter::new(data) {
                    match nested_type {
                        stats2::TCA_STATS_BASIC => {
                            if let Some(basic) = GnetStatsBasic::from_bytes(nested) {
                                counters.bytes = basic.bytes;
                                counters.packets = basic.packets as u64;
                            }
                        }
                        stats2::TCA_STATS_QUEUE => {
                            if let Some(queue) = GnetStatsQueue::from_bytes(nested) {
                                counters.drops = queue.drops as u64;
                                counters.overlimits = queue.overlimits as u64;
                                counters.backlog = queue.backlog as u64;
                            }
                        }
                        _ => {}
                    }
                }
            }
            t if t == TcaAttr::Stats as u16 => {
                // Legacy stats fill in anything STATS2 did not provide.
                if let Some(stats) = TcStats::from_bytes(data) {
                    if counters.bytes == 0 {
                        counters.bytes = stats.bytes;
                        counters.packets = stats.packets as u64;
                    }
                    if counters.drops == 0 {
                        counters.drops = stats.drops as u64;
                        counters.overlimits = stats.overlimits as u64;
                        counters.backlog = stats.backlog as u64;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(RawTcMessage {
        header,
        kind,
        counters,
    })
}

/// Parse a RTM_NEWQDISC dump payload.
pub fn parse_qdisc(payload: &[u8]) -> Result<QdiscInfo> {
    let raw = parse_raw(payload)?;
    Ok(QdiscInfo {
        ifindex: raw.header.tcm_ifindex,
        handle: Handle::from_u32(raw.header.tcm_handle),
        parent: raw.header.tcm_parent,
        kind_enum: QdiscKind::from_kernel(&raw.kind),
        kind: raw.kind,
        counters: raw.counters,
    })
}

/// Parse a RTM_NEWTCLASS dump payload.
pub fn parse_class(payload: &[u8]) -> Result<ClassInfo> {
    let raw = parse_raw(payload)?;
    Ok(ClassInfo {
        ifindex: raw.header.tcm_ifindex,
        handle: Handle::from_u32(raw.header.tcm_handle),
        parent: raw.header.tcm_parent,
        kind: raw.kind,
        counters: raw.counters,
    })
}

/// Parse a RTM_NEWTFILTER dump payload.
pub fn parse_filter(payload: &[u8]) -> Result<FilterInfo> {
    let raw = parse_raw(payload)?;
    // tcm_info packs priority in the high half and the ether-type in
    // network order in the low half.
    Ok(FilterInfo {
        ifindex: raw.header.tcm_ifindex,
        handle: raw.header.tcm_handle,
        parent: Handle::from_u32(raw.header.tcm_parent),
        protocol: u16::from_be((raw.header.tcm_info & 0xFFFF) as u16),
        priority: (raw.header.tcm_info >> 16) as u16,
        kind: raw.kind,
    })
}
