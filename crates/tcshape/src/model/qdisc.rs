//! Queueing discipline entities.
//!
//! A qdisc is a tagged sum of the disciplines this crate can construct,
//! each carrying its own parameter record behind a shared header of
//! `(device, handle, optional parent)`. [`QdiscKind`] is wider than the
//! constructable set so kernel readback can round-trip disciplines the
//! domain model does not build itself.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{Bandwidth, DeviceName, Handle};

/// Discipline type tag.
///
/// Covers everything the readback path may encounter, not just the four
/// variants the aggregate can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QdiscKind {
    Htb,
    Prio,
    Tbf,
    Sfq,
    FqCodel,
    Cake,
    Cbq,
    Hfsc,
}

impl QdiscKind {
    /// Kernel name of the discipline (as carried in TCA_KIND).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Htb => "htb",
            Self::Prio => "prio",
            Self::Tbf => "tbf",
            Self::Sfq => "sfq",
            Self::FqCodel => "fq_codel",
            Self::Cake => "cake",
            Self::Cbq => "cbq",
            Self::Hfsc => "hfsc",
        }
    }

    /// Map a kernel type string back to the enumeration.
    pub fn from_kernel(name: &str) -> Option<Self> {
        Some(match name {
            "htb" => Self::Htb,
            "prio" => Self::Prio,
            "tbf" => Self::Tbf,
            "sfq" => Self::Sfq,
            "fq_codel" => Self::FqCodel,
            "cake" => Self::Cake,
            "cbq" => Self::Cbq,
            "hfsc" => Self::Hfsc,
            _ => return None,
        })
    }
}

/// Fields shared by every qdisc: identity is `(device, handle)`; an
/// absent parent means the qdisc sits at the root of the interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QdiscHeader {
    /// Interface the qdisc is attached to.
    pub device: DeviceName,
    /// Handle naming this qdisc.
    pub handle: Handle,
    /// Parent handle, absent for the root qdisc.
    pub parent: Option<Handle>,
}

/// HTB qdisc parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtbParams {
    /// Class that receives unclassified traffic.
    pub default_class: Handle,
    /// Rate-to-quantum divisor.
    pub r2q: u32,
}

impl Default for HtbParams {
    fn default() -> Self {
        Self {
            default_class: Handle::default(),
            r2q: 10,
        }
    }
}

/// TBF qdisc parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TbfParams {
    /// Token fill rate.
    pub rate: Bandwidth,
    /// Token bucket depth in bytes.
    pub buffer: u32,
    /// Queue limit in packets.
    pub limit: u32,
    /// Burst size in bytes.
    pub burst: u32,
}

impl TbfParams {
    /// Build parameters for a rate, filling in the conventional
    /// defaults: 32 KiB buffer, 10000-packet limit, burst of rate/2000.
    pub fn for_rate(rate: Bandwidth) -> Self {
        Self {
            rate,
            buffer: 32_768,
            limit: 10_000,
            burst: (rate.bits_per_second() / 2_000).max(1) as u32,
        }
    }
}

/// PRIO qdisc parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrioParams {
    /// Number of priority bands (1-16).
    pub bands: u8,
    /// Map from skb priority to band.
    pub priomap: [u8; 16],
}

impl Default for PrioParams {
    fn default() -> Self {
        Self {
            bands: 3,
            priomap: [1, 2, 2, 2, 1, 2, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1],
        }
    }
}

impl PrioParams {
    /// Validate band count and that every priomap entry addresses an
    /// existing band.
    pub fn validate(&self) -> Result<()> {
        if self.bands == 0 || self.bands > 16 {
            return Err(Error::Validation(format!(
                "prio bands must be 1-16, got {}",
                self.bands
            )));
        }
        for (skb_prio, &band) in self.priomap.iter().enumerate() {
            if band >= self.bands {
                return Err(Error::Validation(format!(
                    "priomap entry {skb_prio} selects band {band}, but only {} bands exist",
                    self.bands
                )));
            }
        }
        Ok(())
    }
}

/// FQ_CODEL qdisc parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FqCodelParams {
    /// Queue limit in packets.
    pub limit: u32,
    /// Number of flow queues.
    pub flows: u32,
    /// CoDel target delay in microseconds.
    pub target_us: u32,
    /// CoDel interval in microseconds.
    pub interval_us: u32,
    /// Bytes dequeued from a flow per round.
    pub quantum: u32,
    /// Mark with ECN instead of dropping.
    pub ecn: bool,
}

impl Default for FqCodelParams {
    fn default() -> Self {
        Self {
            limit: 10_240,
            flows: 1_024,
            target_us: 5_000,
            interval_us: 100_000,
            quantum: 1_518,
            ecn: false,
        }
    }
}

/// A queueing discipline attached to an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Qdisc {
    Htb {
        #[serde(flatten)]
        header: QdiscHeader,
        params: HtbParams,
    },
    Tbf {
        #[serde(flatten)]
        header: QdiscHeader,
        params: TbfParams,
    },
    Prio {
        #[serde(flatten)]
        header: QdiscHeader,
        params: PrioParams,
    },
    FqCodel {
        #[serde(flatten)]
        header: QdiscHeader,
        params: FqCodelParams,
    },
}

impl Qdisc {
    /// The shared header.
    pub fn header(&self) -> &QdiscHeader {
        match self {
            Self::Htb { header, .. }
            | Self::Tbf { header, .. }
            | Self::Prio { header, .. }
            | Self::FqCodel { header, .. } => header,
        }
    }

    /// The discipline type tag.
    pub fn kind(&self) -> QdiscKind {
        match self {
            Self::Htb { .. } => QdiscKind::Htb,
            Self::Tbf { .. } => QdiscKind::Tbf,
            Self::Prio { .. } => QdiscKind::Prio,
            Self::FqCodel { .. } => QdiscKind::FqCodel,
        }
    }

    /// Handle naming this qdisc.
    pub fn handle(&self) -> Handle {
        self.header().handle
    }

    /// Parent handle, if any.
    pub fn parent(&self) -> Option<Handle> {
        self.header().parent
    }

    /// Interface this qdisc is attached to.
    pub fn device(&self) -> &DeviceName {
        &self.header().device
    }

    /// Whether classes can be attached beneath this qdisc.
    pub fn is_classful(&self) -> bool {
        matches!(self, Self::Htb { .. })
    }
}
