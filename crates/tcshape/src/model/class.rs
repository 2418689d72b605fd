//! HTB class entity.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{Bandwidth, DeviceName, Handle};

/// Timer frequency assumed when deriving burst sizes from rates.
const HZ: u64 = 1_000;

/// Default MTU used for shaping parameter derivation.
const DEFAULT_MTU: u32 = 1_600;

/// A shaping node inside an HTB hierarchy.
///
/// `rate` is the guaranteed share, `ceil` the borrowing limit. The
/// derived fields (`quantum`, `burst`, `cburst`, ...) are computed at
/// construction the same way `tc` derives them, so that two classes
/// built from the same inputs marshal identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtbClass {
    /// Interface the class lives on.
    pub device: DeviceName,
    /// Parent qdisc or class handle.
    pub parent: Handle,
    /// Handle naming this class.
    pub handle: Handle,
    /// Human-readable class name.
    pub name: String,
    /// Guaranteed rate.
    pub rate: Bandwidth,
    /// Borrowing ceiling. Always >= rate.
    pub ceil: Bandwidth,
    /// Priority 0-7, lower wins when borrowing.
    pub priority: u8,
    /// Bytes to serve per round when rates are equal.
    pub quantum: Option<u32>,
    /// Burst allowance at `rate`, in bytes.
    pub burst: u32,
    /// Burst allowance at `ceil`, in bytes.
    pub cburst: u32,
    /// MTU used for table computation.
    pub mtu: u32,
    /// Minimum packet unit.
    pub mpu: u16,
    /// Per-packet overhead in bytes.
    pub overhead: u16,
    /// Priority as marshalled into tc_htb_opt.
    pub htb_prio: u32,
}

impl HtbClass {
    /// Build a class, validating ranges and deriving shaping parameters.
    pub fn new(
        device: DeviceName,
        parent: Handle,
        handle: Handle,
        name: impl Into<String>,
        rate: Bandwidth,
        ceil: Bandwidth,
        priority: u8,
    ) -> Result<Self> {
        if priority > 7 {
            return Err(Error::Validation(format!(
                "class priority must be 0-7, got {priority}"
            )));
        }
        if rate.is_zero() {
            return Err(Error::Validation("class rate must be non-zero".into()));
        }
        // A zero ceil means "no ceiling was given": borrow nothing
        // beyond the rate, exactly like `tc` defaults ceil to rate.
        let ceil = if ceil.is_zero() { rate } else { ceil };

        let mtu = DEFAULT_MTU;
        let burst = derive_burst(rate, mtu);
        let cburst = derive_burst(ceil, mtu);

        Ok(Self {
            device,
            parent,
            handle,
            name: name.into(),
            rate,
            ceil,
            priority,
            quantum: None,
            burst,
            cburst,
            mtu,
            mpu: 0,
            overhead: 0,
            htb_prio: priority as u32,
        })
    }

    /// Replace rate and ceil, re-deriving the burst allowances.
    pub fn reshape(&mut self, rate: Bandwidth, ceil: Bandwidth) {
        self.rate = rate;
        self.ceil = if ceil.is_zero() { rate } else { ceil };
        self.burst = derive_burst(self.rate, self.mtu);
        self.cburst = derive_burst(self.ceil, self.mtu);
    }

    /// Change the borrowing priority.
    pub fn set_priority(&mut self, priority: u8) -> Result<()> {
        if priority > 7 {
            return Err(Error::Validation(format!(
                "class priority must be 0-7, got {priority}"
            )));
        }
        self.priority = priority;
        self.htb_prio = priority as u32;
        Ok(())
    }
}

/// Burst bytes for one timer tick at `rate`, plus one MTU of slack.
fn derive_burst(rate: Bandwidth, mtu: u32) -> u32 {
    (rate.bytes_per_second() / HZ + mtu as u64).min(u32::MAX as u64) as u32
}
