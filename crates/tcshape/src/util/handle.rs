//! TC handle parsing and formatting.
//!
//! TC handles are 32-bit values split into major:minor parts (16 bits
//! each). They name qdiscs and classes in the traffic control hierarchy.
//! The textual form is hexadecimal `MAJOR:MINOR`; `MAJOR:` means minor 0
//! (the root of a qdisc namespace).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A TC handle with major:minor components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Handle {
    /// Major number (upper 16 bits).
    pub major: u16,
    /// Minor number (lower 16 bits).
    pub minor: u16,
}

impl Handle {
    /// Create a new handle from major:minor components.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Create a handle from a raw 32-bit value (major in the high half).
    pub const fn from_u32(raw: u32) -> Self {
        Self {
            major: (raw >> 16) as u16,
            minor: (raw & 0xFFFF) as u16,
        }
    }

    /// Convert to a raw 32-bit value.
    pub const fn to_u32(self) -> u32 {
        ((self.major as u32) << 16) | (self.minor as u32)
    }

    /// A handle with minor 0 names the root of a qdisc namespace.
    pub const fn is_root(self) -> bool {
        self.minor == 0
    }

    /// Parse a `MAJOR:MINOR` string (case-insensitive hex, minor may be
    /// empty).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some((major_s, minor_s)) = s.split_once(':') else {
            return Err(Error::Validation(format!("invalid handle {s:?}: missing ':'")));
        };
        if minor_s.contains(':') {
            return Err(Error::Validation(format!(
                "invalid handle {s:?}: more than one ':'"
            )));
        }
        let major = u16::from_str_radix(major_s, 16)
            .map_err(|_| Error::Validation(format!("invalid handle {s:?}: bad major {major_s:?}")))?;
        let minor = if minor_s.is_empty() {
            0
        } else {
            u16::from_str_radix(minor_s, 16).map_err(|_| {
                Error::Validation(format!("invalid handle {s:?}: bad minor {minor_s:?}"))
            })?
        };
        Ok(Self { major, minor })
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{:x}:", self.major)
        } else {
            write!(f, "{:x}:{:x}", self.major, self.minor)
        }
    }
}

impl FromStr for Handle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Self::from_u32(raw)
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> Self {
        handle.to_u32()
    }
}

impl Serialize for Handle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
