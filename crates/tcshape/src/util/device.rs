//! Network interface name value type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum interface name length (IFNAMSIZ includes the trailing NUL).
const IFNAMSIZ: usize = 16;

/// A validated network interface name.
///
/// Opaque beyond minimal checks: non-empty, fits in IFNAMSIZ, no
/// whitespace. Existence on the running system is checked by the
/// netlink layer, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceName(String);

impl DeviceName {
    /// Validate and wrap an interface name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Validation("device name must not be empty".into()));
        }
        if name.len() >= IFNAMSIZ {
            return Err(Error::Validation(format!(
                "device name {name:?} exceeds {} characters",
                IFNAMSIZ - 1
            )));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!(
                "device name {name:?} must not contain whitespace"
            )));
        }
        Ok(Self(name))
    }

    /// The raw interface name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
