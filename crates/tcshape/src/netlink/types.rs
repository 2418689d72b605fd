//! Kernel wire structs and constants for the rtm_tca family.
//!
//! Field layouts mirror the kernel headers exactly; anything written to
//! a message goes through `as_bytes()`/`to_bytes()` so byte-order
//! conversion lives here and nowhere else.

use crate::error::{Error, Result};

/// Traffic control message header (struct tcmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcMsg {
    /// Address family.
    pub tcm_family: u8,
    /// Padding.
    pub tcm__pad1: u8,
    /// Padding.
    pub tcm__pad2: u16,
    /// Interface index.
    pub tcm_ifindex: i32,
    /// Qdisc/class handle.
    pub tcm_handle: u32,
    /// Parent handle.
    pub tcm_parent: u32,
    /// For filters: (priority << 16) | ether-type in network order.
    pub tcm_info: u32,
}

impl TcMsg {
    /// Size of this structure.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create an empty TC message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface index.
    pub fn with_ifindex(mut self, ifindex: i32) -> Self {
        self.tcm_ifindex = ifindex;
        self
    }

    /// Set the handle.
    pub fn with_handle(mut self, handle: u32) -> Self {
        self.tcm_handle = handle;
        self
    }

    /// Set the parent.
    pub fn with_parent(mut self, parent: u32) -> Self {
        self.tcm_parent = parent;
        self
    }

    /// Set the info word.
    pub fn with_info(mut self, info: u32) -> Self {
        self.tcm_info = info;
        self
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(unsafe { &*(data.as_ptr() as *const Self) })
    }
}

/// Top-level TCA_* attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TcaAttr {
    Unspec = 0,
    Kind = 1,
    Options = 2,
    Stats = 3,
    Xstats = 4,
    Rate = 5,
    Fcnt = 6,
    Stats2 = 7,
    Stab = 8,
}

/// Special handle words.
pub mod tc_handle {
    /// Root qdisc sentinel.
    pub const ROOT: u32 = 0xFFFF_FFFF;
    /// Ingress qdisc sentinel.
    pub const INGRESS: u32 = 0xFFFF_FFF1;
    /// Unspecified.
    pub const UNSPEC: u32 = 0;
}

/// Rate specification (struct tc_ratespec). Rates are bytes/sec.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcRateSpec {
    pub cell_log: u8,
    pub linklayer: u8,
    pub overhead: u16,
    pub cell_align: i16,
    pub mpu: u16,
    pub rate: u32,
}

impl TcRateSpec {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// A plain rate with no overhead accounting.
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            ..Default::default()
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

/// HTB qdisc attributes and structs.
pub mod htb {
    pub const TCA_HTB_PARMS: u16 = 1;
    pub const TCA_HTB_INIT: u16 = 2;
    pub const TCA_HTB_CTAB: u16 = 3;
    pub const TCA_HTB_RTAB: u16 = 4;
    pub const TCA_HTB_DIRECT_QLEN: u16 = 5;
    pub const TCA_HTB_RATE64: u16 = 6;
    pub const TCA_HTB_CEIL64: u16 = 7;

    /// HTB global parameters (struct tc_htb_glob).
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct TcHtbGlob {
        pub version: u32,
        pub rate2quantum: u32,
        pub defcls: u32,
        pub debug: u32,
        pub direct_pkts: u32,
    }

    impl Default for TcHtbGlob {
        fn default() -> Self {
            Self {
                version: 3,
                rate2quantum: 10,
                defcls: 0,
                debug: 0,
                direct_pkts: 0,
            }
        }
    }

    impl TcHtbGlob {
        pub const SIZE: usize = std::mem::size_of::<Self>();

        pub fn as_bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
        }
    }

    /// HTB class parameters (struct tc_htb_opt).
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TcHtbOpt {
        pub rate: super::TcRateSpec,
        pub ceil: super::TcRateSpec,
        pub buffer: u32,
        pub cbuffer: u32,
        pub quantum: u32,
        pub level: u32,
        pub prio: u32,
    }

    impl TcHtbOpt {
        pub const SIZE: usize = std::mem::size_of::<Self>();

        pub fn as_bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
        }
    }
}

/// TBF qdisc attributes and structs.
pub mod tbf {
    pub const TCA_TBF_PARMS: u16 = 1;
    pub const TCA_TBF_RATE64: u16 = 4;

    /// TBF parameters (struct tc_tbf_qopt).
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TcTbfQopt {
        pub rate: super::TcRateSpec,
        pub peakrate: super::TcRateSpec,
        pub limit: u32,
        pub buffer: u32,
        pub mtu: u32,
    }

    impl TcTbfQopt {
        pub const SIZE: usize = std::mem::size_of::<Self>();

        pub fn as_bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
        }
    }
}

/// PRIO qdisc struct.
pub mod prio {
    /// PRIO parameters (struct tc_prio_qopt).
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct TcPrioQopt {
        pub bands: i32,
        pub priomap: [u8; 16],
    }

    impl TcPrioQopt {
        pub const SIZE: usize = std::mem::size_of::<Self>();

        pub fn as_bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
        }
    }
}

/// FQ_CODEL qdisc attributes.
pub mod fq_codel {
    pub const TCA_FQ_CODEL_TARGET: u16 = 1;
    pub const TCA_FQ_CODEL_LIMIT: u16 = 2;
    pub const TCA_FQ_CODEL_INTERVAL: u16 = 3;
    pub const TCA_FQ_CODEL_ECN: u16 = 4;
    pub const TCA_FQ_CODEL_FLOWS: u16 = 5;
    pub const TCA_FQ_CODEL_QUANTUM: u16 = 6;
}

/// NETEM qdisc attributes and structs.
pub mod netem {
    pub const TCA_NETEM_CORR: u16 = 1;
    pub const TCA_NETEM_REORDER: u16 = 3;
    pub const TCA_NETEM_CORRUPT: u16 = 4;
    pub const TCA_NETEM_RATE: u16 = 6;
    pub const TCA_NETEM_LATENCY64: u16 = 10;
    pub const TCA_NETEM_JITTER64: u16 = 11;

    /// Netem basic options (struct tc_netem_qopt).
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TcNetemQopt {
        /// Added delay in microseconds.
        pub latency: u32,
        /// FIFO limit (packets).
        pub limit: u32,
        /// Random packet loss (0=none, ~0=100%).
        pub loss: u32,
        /// Re-ordering gap (0 for none).
        pub gap: u32,
        /// Random packet duplication.
        pub duplicate: u32,
        /// Random jitter in microseconds.
        pub jitter: u32,
    }

    impl TcNetemQopt {
        pub const SIZE: usize = std::mem::size_of::<Self>();

        pub fn as_bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
        }
    }

    /// Netem reorder probability (struct tc_netem_reorder).
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TcNetemReorder {
        pub probability: u32,
        pub correlation: u32,
    }

    impl TcNetemReorder {
        pub const SIZE: usize = std::mem::size_of::<Self>();

        pub fn as_bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
        }
    }

    /// Netem corrupt probability (struct tc_netem_corrupt).
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TcNetemCorrupt {
        pub probability: u32,
        pub correlation: u32,
    }

    impl TcNetemCorrupt {
        pub const SIZE: usize = std::mem::size_of::<Self>();

        pub fn as_bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
        }
    }

    /// Kernel fixed-point probability: percentage over the full u32
    /// range.
    pub fn percent_to_prob(percent: f64) -> u32 {
        ((percent.clamp(0.0, 100.0) / 100.0) * (u32::MAX as f64)) as u32
    }
}

/// Classifier attributes and structs.
pub mod filter {
    /// U32 classifier attributes and structs.
    pub mod u32 {
        pub const TCA_U32_CLASSID: u16 = 1;
        pub const TCA_U32_HASH: u16 = 2;
        pub const TCA_U32_LINK: u16 = 3;
        pub const TCA_U32_DIVISOR: u16 = 4;
        pub const TCA_U32_SEL: u16 = 5;
        pub const TCA_U32_POLICE: u16 = 6;
        pub const TCA_U32_ACT: u16 = 7;

        /// Selector flag: this node selects a class (terminal).
        pub const TC_U32_TERMINAL: u8 = 1;

        /// One selector key (struct tc_u32_key).
        ///
        /// `val` and `mask` are held in host order here; serialization
        /// converts them to network order, so callers and tests reason in
        /// plain numbers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct TcU32Key {
            /// Bits that participate in the comparison.
            pub mask: u32,
            /// Expected value of the masked bits.
            pub val: u32,
            /// Byte offset of the 32-bit word within the packet.
            pub off: i32,
            /// Offset mask for variable headers (0 for fixed offsets).
            pub offmask: i32,
        }

        impl TcU32Key {
            /// A key at a fixed byte offset.
            pub const fn new(val: u32, mask: u32, off: i32) -> Self {
                Self {
                    mask,
                    val,
                    off,
                    offmask: 0,
                }
            }

            fn write(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.mask.to_be_bytes());
                out.extend_from_slice(&self.val.to_be_bytes());
                out.extend_from_slice(&self.off.to_ne_bytes());
                out.extend_from_slice(&self.offmask.to_ne_bytes());
            }
        }

        /// The selector (struct tc_u32_sel) plus its flexible key array.
        #[derive(Debug, Clone, Default)]
        pub struct TcU32Sel {
            pub flags: u8,
            pub offshift: u8,
            pub offmask: u16,
            pub off: u16,
            pub offoff: i16,
            pub hoff: i16,
            pub hmask: u32,
            keys: Vec<TcU32Key>,
        }

        impl TcU32Sel {
            /// An empty selector.
            pub fn new() -> Self {
                Self::default()
            }

            /// Mark the selector terminal (it selects a class).
            pub fn set_terminal(&mut self) {
                self.flags |= TC_U32_TERMINAL;
            }

            /// Append a key; `nkeys` tracks the list automatically.
            pub fn add_key(&mut self, key: TcU32Key) {
                self.keys.push(key);
            }

            /// The accumulated keys.
            pub fn keys(&self) -> &[TcU32Key] {
                &self.keys
            }

            /// Number of keys.
            pub fn nkeys(&self) -> u8 {
                self.keys.len() as u8
            }

            /// Serialize header + keys in kernel layout.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut out = Vec::with_capacity(16 + self.keys.len() * 16);
                out.push(self.flags);
                out.push(self.offshift);
                out.push(self.nkeys());
                out.push(0); // implicit padding before __be16 offmask
                out.extend_from_slice(&self.offmask.to_be_bytes());
                out.extend_from_slice(&self.off.to_ne_bytes());
                out.extend_from_slice(&self.offoff.to_ne_bytes());
                out.extend_from_slice(&self.hoff.to_ne_bytes());
                out.extend_from_slice(&self.hmask.to_be_bytes());
                for key in &self.keys {
                    key.write(&mut out);
                }
                out
            }
        }
    }
}

/// Police action attributes and structs.
pub mod police {
    pub const TCA_POLICE_TBF: u16 = 1;
    pub const TCA_POLICE_RATE: u16 = 2;
    pub const TCA_POLICE_PEAKRATE: u16 = 3;

    /// Police decisions (TC_POLICE_*).
    pub const TC_POLICE_UNSPEC: i32 = -1;
    pub const TC_POLICE_OK: i32 = 0;
    pub const TC_POLICE_RECLASSIFY: i32 = 1;
    pub const TC_POLICE_SHOT: i32 = 2;
    pub const TC_POLICE_PIPE: i32 = 3;

    /// Police parameters (struct tc_police).
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TcPolice {
        pub index: u32,
        pub action: i32,
        pub limit: u32,
        pub burst: u32,
        pub mtu: u32,
        pub rate: super::TcRateSpec,
        pub peakrate: super::TcRateSpec,
        pub refcnt: i32,
        pub bindcnt: i32,
        pub capab: u32,
    }

    impl TcPolice {
        pub const SIZE: usize = std::mem::size_of::<Self>();

        pub fn as_bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
        }
    }
}

/// TC statistics (struct tc_stats, legacy TCA_STATS).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcStats {
    pub bytes: u64,
    pub packets: u32,
    pub drops: u32,
    pub overlimits: u32,
    pub bps: u32,
    pub pps: u32,
    pub qlen: u32,
    pub backlog: u32,
}

impl TcStats {
    /// Parse from a TCA_STATS payload.
    pub fn from_bytes(data: &[u8]) -> Option<&Self> {
        if data.len() >= std::mem::size_of::<Self>() {
            Some(unsafe { &*(data.as_ptr() as *const Self) })
        } else {
            None
        }
    }
}

/// Nested TCA_STATS2 attribute ids.
pub mod stats2 {
    pub const TCA_STATS_BASIC: u16 = 1;
    pub const TCA_STATS_QUEUE: u16 = 3;
}

/// Basic counters (struct gnet_stats_basic).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GnetStatsBasic {
    pub bytes: u64,
    pub packets: u32,
}

impl GnetStatsBasic {
    /// Parse from a TCA_STATS_BASIC payload.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        let bytes = u64::from_ne_bytes(data[0..8].try_into().ok()?);
        let packets = u32::from_ne_bytes(data[8..12].try_into().ok()?);
        Some(Self { bytes, packets })
    }
}

/// Queue counters (struct gnet_stats_queue).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GnetStatsQueue {
    pub qlen: u32,
    pub backlog: u32,
    pub drops: u32,
    pub requeues: u32,
    pub overlimits: u32,
}

impl GnetStatsQueue {
    /// Parse from a TCA_STATS_QUEUE payload.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 20 {
            return None;
        }
        let word = |i: usize| u32::from_ne_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Some(Self {
            qlen: word(0),
            backlog: word(4),
            drops: word(8),
            requeues: word(12),
            overlimits: word(16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcmsg_layout() {
        assert_eq!(TcMsg::SIZE, 20);
        let msg = TcMsg::new()
            .with_ifindex(3)
            .with_handle(0x0001_0000)
            .with_parent(tc_handle::ROOT)
            .with_info((100u32 << 16) | (0x0800u16.to_be() as u32));
        let bytes = msg.as_bytes();
        assert_eq!(bytes.len(), 20);
        let parsed = TcMsg::from_bytes(bytes).unwrap();
        assert_eq!(parsed.tcm_ifindex, 3);
        assert_eq!(parsed.tcm_parent, tc_handle::ROOT);
    }

    #[test]
    fn htb_glob_defaults() {
        let glob = htb::TcHtbGlob::default();
        assert_eq!(glob.version, 3);
        assert_eq!(glob.rate2quantum, 10);
        assert_eq!(htb::TcHtbGlob::SIZE, 20);
    }

    #[test]
    fn htb_opt_layout() {
        // 2 ratespecs (12 bytes each) + 5 u32s
        assert_eq!(htb::TcHtbOpt::SIZE, 44);
        assert_eq!(TcRateSpec::SIZE, 12);
    }

    #[test]
    fn u32_selector_serializes_kernel_layout() {
        let mut sel = filter::u32::TcU32Sel::new();
        sel.set_terminal();
        sel.add_key(filter::u32::TcU32Key::new(5201, 0x0000_FFFF, 22));
        let bytes = sel.to_bytes();

        // 16-byte header + one 16-byte key
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], filter::u32::TC_U32_TERMINAL);
        assert_eq!(bytes[2], 1); // nkeys
        // Key mask and value are written in network order.
        assert_eq!(&bytes[16..20], &0x0000_FFFFu32.to_be_bytes());
        assert_eq!(&bytes[20..24], &5201u32.to_be_bytes());
        assert_eq!(&bytes[24..28], &22i32.to_ne_bytes());
    }

    #[test]
    fn u32_selector_accumulates_keys() {
        let mut sel = filter::u32::TcU32Sel::new();
        sel.add_key(filter::u32::TcU32Key::new(6, 0xFF, 9));
        sel.add_key(filter::u32::TcU32Key::new(443, 0x0000_FFFF, 22));
        assert_eq!(sel.nkeys(), 2);
        let bytes = sel.to_bytes();
        assert_eq!(bytes.len(), 16 + 2 * 16);
        assert_eq!(bytes[2], 2);
    }

    #[test]
    fn netem_probability_fixed_point() {
        assert_eq!(netem::percent_to_prob(0.0), 0);
        assert_eq!(netem::percent_to_prob(100.0), u32::MAX);
        let half = netem::percent_to_prob(50.0);
        assert!((half as f64 / u32::MAX as f64 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn stats_parsers_tolerate_short_payloads() {
        assert!(GnetStatsBasic::from_bytes(&[0u8; 4]).is_none());
        assert!(GnetStatsQueue::from_bytes(&[0u8; 8]).is_none());
        let basic = GnetStatsBasic::from_bytes(&{
            let mut v = 42u64.to_ne_bytes().to_vec();
            v.extend_from_slice(&7u32.to_ne_bytes());
            v
        })
        .unwrap();
        assert_eq!(basic.bytes, 42);
        assert_eq!(basic.packets, 7);
    }
}
