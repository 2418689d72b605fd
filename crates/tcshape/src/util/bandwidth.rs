//! Bandwidth value type.
//!
//! A bandwidth is an unsigned count of bits per second. The textual form
//! is `<number><unit>` with unit one of `bps`, `kbps`, `mbps`, `gbps`
//! (case-insensitive, decimal multipliers, fractions allowed). Display
//! auto-scales to the largest unit with one decimal, e.g. `10.0Mbps`.

use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const KILO: u64 = 1_000;
const MEGA: u64 = 1_000_000;
const GIGA: u64 = 1_000_000_000;

/// Bandwidth in bits per second.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Bandwidth(u64);

impl Bandwidth {
    /// Construct from bits per second.
    pub const fn from_bps(bits: u64) -> Self {
        Self(bits)
    }

    /// Construct from kilobits per second.
    pub const fn from_kbps(kbits: u64) -> Self {
        Self(kbits * KILO)
    }

    /// Construct from megabits per second.
    pub const fn from_mbps(mbits: u64) -> Self {
        Self(mbits * MEGA)
    }

    /// Construct from gigabits per second.
    pub const fn from_gbps(gbits: u64) -> Self {
        Self(gbits * GIGA)
    }

    /// Bits per second.
    pub const fn bits_per_second(self) -> u64 {
        self.0
    }

    /// Bytes per second. This is the unit the kernel expects in rate
    /// specs; the division happens here, not in callers.
    pub const fn bytes_per_second(self) -> u64 {
        self.0 / 8
    }

    /// Saturating subtraction: floors at zero.
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// A percentage of this bandwidth.
    pub fn percent(self, pct: u64) -> Self {
        Self(self.0 / 100 * pct + self.0 % 100 * pct / 100)
    }

    /// True if this is a zero rate.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Parse `<number><unit>`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        // Longest suffix first so "bps" does not shadow "kbps".
        let (number, multiplier) = if let Some(n) = lower.strip_suffix("kbps") {
            (n, KILO)
        } else if let Some(n) = lower.strip_suffix("mbps") {
            (n, MEGA)
        } else if let Some(n) = lower.strip_suffix("gbps") {
            (n, GIGA)
        } else if let Some(n) = lower.strip_suffix("bps") {
            (n, 1)
        } else {
            return Err(Error::Validation(format!(
                "invalid bandwidth {s:?}: missing unit (bps, kbps, mbps, gbps)"
            )));
        };

        let number = number.trim();
        let value: f64 = number
            .parse()
            .map_err(|_| Error::Validation(format!("invalid bandwidth {s:?}: bad number {number:?}")))?;
        if !value.is_finite() || value < 0.0 {
            return Err(Error::Validation(format!(
                "invalid bandwidth {s:?}: rate must be a non-negative number"
            )));
        }
        Ok(Self((value * multiplier as f64).round() as u64))
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.0;
        if bits >= GIGA {
            write!(f, "{:.1}Gbps", bits as f64 / GIGA as f64)
        } else if bits >= MEGA {
            write!(f, "{:.1}Mbps", bits as f64 / MEGA as f64)
        } else if bits >= KILO {
            write!(f, "{:.1}Kbps", bits as f64 / KILO as f64)
        } else {
            write!(f, "{bits}bps")
        }
    }
}

impl FromStr for Bandwidth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Add for Bandwidth {
    type Output = Bandwidth;

    fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl Sub for Bandwidth {
    type Output = Bandwidth;

    /// Saturates at zero rather than underflowing.
    fn sub(self, other: Self) -> Self {
        self.saturating_sub(other)
    }
}

impl Mul<u64> for Bandwidth {
    type Output = Bandwidth;

    fn mul(self, scalar: u64) -> Self {
        Self(self.0.saturating_mul(scalar))
    }
}
