//! U32 classifier construction.
//!
//! Each domain [`Match`] becomes one `{mask, value, offset}` key
//! matching 32 bits at a byte offset in the IPv4 header (20-byte header
//! without options assumed). Every match on a filter accumulates into a
//! single selector key list, so `[protocol tcp, dport 443]` yields two
//! keys ANDed by the kernel.

use super::builder::MessageBuilder;
use super::police::PoliceSpec;
use super::types::filter::u32::{TCA_U32_CLASSID, TCA_U32_SEL, TcU32Key, TcU32Sel};
use crate::error::{Error, Result};
use crate::model::Match;
use crate::util::Handle;

/// Byte offsets into the IPv4 packet.
mod offsets {
    /// TOS byte.
    pub const TOS: i32 = 1;
    /// Transport protocol byte.
    pub const PROTOCOL: i32 = 9;
    /// Source address word.
    pub const IP_SRC: i32 = 12;
    /// Destination address word.
    pub const IP_DST: i32 = 16;
    /// Source port (first 16 bits after the 20-byte header).
    pub const SPORT: i32 = 20;
    /// Destination port.
    pub const DPORT: i32 = 22;
}

/// A fully-resolved U32 filter ready for marshalling.
#[derive(Debug, Clone)]
pub struct U32FilterSpec {
    /// Target class.
    pub class_id: Handle,
    /// Selector accumulated from the match list. Empty keys means
    /// match-all.
    pub selector: TcU32Sel,
    /// Optional police action.
    pub police: Option<PoliceSpec>,
}

impl U32FilterSpec {
    /// Build the spec from a domain match list.
    pub fn from_matches(class_id: Handle, matches: &[Match]) -> Result<Self> {
        Ok(Self {
            class_id,
            selector: selector_for_matches(matches)?,
            police: None,
        })
    }

    /// Attach a police action.
    pub fn with_police(mut self, police: PoliceSpec) -> Self {
        self.police = Some(police);
        self
    }
}

/// Accumulate every match into one selector.
pub fn selector_for_matches(matches: &[Match]) -> Result<TcU32Sel> {
    let mut selector = TcU32Sel::new();
    selector.set_terminal();
    for m in matches {
        if let Some(key) = key_for_match(m)? {
            selector.add_key(key);
        }
    }
    Ok(selector)
}

/// The key for one match, or `None` for matches that carry metadata
/// only (flow-id).
fn key_for_match(m: &Match) -> Result<Option<TcU32Key>> {
    Ok(match m {
        Match::SourceIp { cidr } => Some(TcU32Key::new(
            cidr.network(),
            cidr.mask(),
            offsets::IP_SRC,
        )),
        Match::DestinationIp { cidr } => Some(TcU32Key::new(
            cidr.network(),
            cidr.mask(),
            offsets::IP_DST,
        )),
        Match::Protocol { protocol } => Some(TcU32Key::new(
            protocol.number() as u32,
            0x0000_00FF,
            offsets::PROTOCOL,
        )),
        Match::SourcePort { port } => Some(TcU32Key::new(
            (*port as u32) << 16,
            0xFFFF_0000,
            offsets::SPORT,
        )),
        Match::DestinationPort { port } => Some(TcU32Key::new(
            *port as u32,
            0x0000_FFFF,
            offsets::DPORT,
        )),
        Match::SourcePortRange { start, end } => {
            let (value, mask) = range_value_mask(*start, *end)?;
            Some(TcU32Key::new(
                (value as u32) << 16,
                (mask as u32) << 16,
                offsets::SPORT,
            ))
        }
        Match::DestinationPortRange { start, end } => {
            let (value, mask) = range_value_mask(*start, *end)?;
            Some(TcU32Key::new(value as u32, mask as u32, offsets::DPORT))
        }
        Match::Tos { value } => Some(TcU32Key::new(*value as u32, 0x0000_00FF, offsets::TOS)),
        Match::Dscp { value } => Some(TcU32Key::new(
            (*value as u32) << 2,
            0x0000_00FC,
            offsets::TOS,
        )),
        // Flow-id is steering metadata; the classid attribute carries it.
        Match::Flow { .. } => None,
    })
}

/// A port range can be one u32 key only when it covers an aligned
/// power-of-two block (e.g. 8000-8063). Anything else needs multiple
/// filters and is rejected here.
fn range_value_mask(start: u16, end: u16) -> Result<(u16, u16)> {
    if start > end {
        return Err(Error::Validation(format!(
            "invalid port range {start}-{end}: start exceeds end"
        )));
    }
    let size = (end - start) as u32 + 1;
    if !size.is_power_of_two() || (start as u32) % size != 0 {
        return Err(Error::Validation(format!(
            "port range {start}-{end} does not align to a maskable block"
        )));
    }
    let mask = !(size - 1) as u16;
    Ok((start, mask))
}

/// Write the TCA_OPTIONS payload of a u32 filter. The nest is opened
/// and closed by the caller.
pub fn write_u32_options(builder: &mut MessageBuilder, spec: &U32FilterSpec) -> Result<()> {
    builder.append_attr_u32(TCA_U32_CLASSID, spec.class_id.to_u32());

    // No matches means match-all: omit the selector entirely.
    if spec.selector.nkeys() > 0 {
        builder.append_attr(TCA_U32_SEL, &spec.selector.to_bytes());
    }

    if let Some(police) = &spec.police {
        police.write(builder)?;
    }

    Ok(())
}
