//! Packet classifier entities.
//!
//! A filter attaches to a qdisc or class, carries an ordered list of
//! [`Match`] predicates (ANDed together), and steers matching packets to
//! the class named by `flow_id`.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{DeviceName, Handle};

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cidr {
    /// Network address.
    pub addr: Ipv4Addr,
    /// Prefix length, 0-32.
    pub prefix: u8,
}

impl Cidr {
    /// Construct a CIDR, validating the prefix length.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::Validation(format!(
                "invalid prefix length /{prefix}: must be 0-32"
            )));
        }
        Ok(Self { addr, prefix })
    }

    /// Parse `a.b.c.d` (treated as /32) or `a.b.c.d/len`.
    pub fn parse(s: &str) -> Result<Self> {
        let (addr_s, prefix) = match s.split_once('/') {
            Some((a, p)) => {
                let prefix: u8 = p
                    .parse()
                    .map_err(|_| Error::Validation(format!("invalid CIDR {s:?}: bad prefix")))?;
                (a, prefix)
            }
            None => (s, 32),
        };
        let addr: Ipv4Addr = addr_s
            .parse()
            .map_err(|_| Error::Validation(format!("invalid CIDR {s:?}: bad address")))?;
        Self::new(addr, prefix)
    }

    /// The netmask as a host-order 32-bit word.
    pub fn mask(self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        }
    }

    /// The network address as a host-order word, masked.
    pub fn network(self) -> u32 {
        u32::from(self.addr) & self.mask()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Transport-layer protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    /// Any other IANA protocol number.
    Other(u8),
}

impl TransportProtocol {
    /// The IANA protocol number.
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Other(n) => n,
        }
    }

    /// Parse a protocol name or numeric string.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "icmp" => Self::Icmp,
            other => {
                let n: u8 = other.parse().map_err(|_| {
                    Error::Validation(format!("invalid transport protocol {s:?}"))
                })?;
                Self::from_number(n)
            }
        })
    }

    /// Canonicalize a protocol number.
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Icmp => f.write_str("icmp"),
            Self::Other(n) => write!(f, "{n}"),
        }
    }
}

/// Ether-type the filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterProtocol {
    /// Match every protocol.
    #[default]
    All,
    Ipv4,
    Ipv6,
}

impl FilterProtocol {
    /// Ether-type constant carried in tcm_info. Zero matches every
    /// protocol.
    pub fn ether_type(self) -> u16 {
        match self {
            Self::All => 0,
            Self::Ipv4 => 0x0800,
            Self::Ipv6 => 0x86DD,
        }
    }
}

/// A single packet predicate. Multiple matches on one filter combine
/// with AND semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Match {
    /// Source network.
    SourceIp { cidr: Cidr },
    /// Destination network.
    DestinationIp { cidr: Cidr },
    /// Exact source port.
    SourcePort { port: u16 },
    /// Exact destination port.
    DestinationPort { port: u16 },
    /// Inclusive source port range.
    SourcePortRange { start: u16, end: u16 },
    /// Inclusive destination port range.
    DestinationPortRange { start: u16, end: u16 },
    /// Transport protocol.
    Protocol { protocol: TransportProtocol },
    /// Type-of-service byte.
    Tos { value: u8 },
    /// DSCP code point (upper six bits of the TOS byte).
    Dscp { value: u8 },
    /// Steering marker carrying the target class; contributes no
    /// selector key of its own.
    Flow { handle: Handle },
}

impl fmt::Display for Match {
    /// Stable textual form, used in logs and error messages.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceIp { cidr } => write!(f, "src {cidr}"),
            Self::DestinationIp { cidr } => write!(f, "dst {cidr}"),
            Self::SourcePort { port } => write!(f, "sport {port}"),
            Self::DestinationPort { port } => write!(f, "dport {port}"),
            Self::SourcePortRange { start, end } => write!(f, "sport {start}-{end}"),
            Self::DestinationPortRange { start, end } => write!(f, "dport {start}-{end}"),
            Self::Protocol { protocol } => write!(f, "protocol {protocol}"),
            Self::Tos { value } => write!(f, "tos 0x{value:02x}"),
            Self::Dscp { value } => write!(f, "dscp {value}"),
            Self::Flow { handle } => write!(f, "flowid {handle}"),
        }
    }
}

/// A packet classifier attached to a parent qdisc or class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Interface the filter lives on.
    pub device: DeviceName,
    /// Parent qdisc or class handle.
    pub parent: Handle,
    /// Match precedence, lower matches first.
    pub priority: u16,
    /// Handle naming this filter within its parent.
    pub handle: Handle,
    /// Class matching packets are steered into.
    pub flow_id: Handle,
    /// Ether-type this filter applies to.
    pub protocol: FilterProtocol,
    /// Ordered predicates, ANDed.
    pub matches: Vec<Match>,
}

impl Filter {
    /// Build a filter, validating the match list.
    pub fn new(
        device: DeviceName,
        parent: Handle,
        priority: u16,
        handle: Handle,
        flow_id: Handle,
        protocol: FilterProtocol,
        matches: Vec<Match>,
    ) -> Result<Self> {
        validate_matches(&matches)?;
        Ok(Self {
            device,
            parent,
            priority,
            handle,
            flow_id,
            protocol,
            matches,
        })
    }

    /// Locator used in delete/modify lookups and NotFound messages.
    pub fn locator(&self) -> (Handle, u16, Handle) {
        (self.parent, self.priority, self.handle)
    }
}

/// Validate a match list: at most one transport-protocol match, sane
/// port ranges. Everything else may repeat and combines with AND.
pub fn validate_matches(matches: &[Match]) -> Result<()> {
    let protocol_matches = matches
        .iter()
        .filter(|m| matches!(m, Match::Protocol { .. }))
        .count();
    if protocol_matches > 1 {
        return Err(Error::Validation(format!(
            "at most one transport protocol match is allowed, got {protocol_matches}"
        )));
    }
    for m in matches {
        match m {
            Match::SourcePortRange { start, end } | Match::DestinationPortRange { start, end } => {
                if start > end {
                    return Err(Error::Validation(format!(
                        "invalid port range {start}-{end}: start exceeds end"
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_parse_and_mask() {
        let cidr = Cidr::parse("192.168.1.0/24").unwrap();
        assert_eq!(cidr.mask(), 0xFFFF_FF00);
        assert_eq!(cidr.network(), u32::from(Ipv4Addr::new(192, 168, 1, 0)));
        assert_eq!(cidr.to_string(), "192.168.1.0/24");

        // Bare address is a /32
        assert_eq!(Cidr::parse("10.0.0.1").unwrap().prefix, 32);
        // Host bits are masked off for network()
        let sloppy = Cidr::parse("10.1.2.3/8").unwrap();
        assert_eq!(sloppy.network(), u32::from(Ipv4Addr::new(10, 0, 0, 0)));

        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("300.0.0.1/8").is_err());
        assert!(Cidr::parse("not-an-ip").is_err());
    }

    #[test]
    fn transport_protocol_numbers() {
        assert_eq!(TransportProtocol::Tcp.number(), 6);
        assert_eq!(TransportProtocol::Udp.number(), 17);
        assert_eq!(TransportProtocol::Icmp.number(), 1);
        assert_eq!(TransportProtocol::parse("TCP").unwrap(), TransportProtocol::Tcp);
        assert_eq!(TransportProtocol::parse("47").unwrap(), TransportProtocol::Other(47));
        assert_eq!(TransportProtocol::parse("6").unwrap(), TransportProtocol::Tcp);
        assert!(TransportProtocol::parse("quic").is_err());
    }

    #[test]
    fn at_most_one_protocol_match() {
        let matches = vec![
            Match::Protocol {
                protocol: TransportProtocol::Tcp,
            },
            Match::Protocol {
                protocol: TransportProtocol::Udp,
            },
        ];
        assert!(validate_matches(&matches).is_err());
    }

    #[test]
    fn port_range_sanity() {
        assert!(validate_matches(&[Match::SourcePortRange { start: 10, end: 5 }]).is_err());
        assert!(validate_matches(&[Match::DestinationPortRange { start: 5, end: 10 }]).is_ok());
    }

    #[test]
    fn mixed_matches_are_allowed() {
        let matches = vec![
            Match::SourceIp {
                cidr: Cidr::parse("10.0.0.0/8").unwrap(),
            },
            Match::DestinationPort { port: 443 },
            Match::Protocol {
                protocol: TransportProtocol::Tcp,
            },
            Match::Tos { value: 0x10 },
        ];
        assert!(validate_matches(&matches).is_ok());
    }

    #[test]
    fn textual_forms_are_stable() {
        assert_eq!(
            Match::SourceIp {
                cidr: Cidr::parse("10.0.0.0/8").unwrap()
            }
            .to_string(),
            "src 10.0.0.0/8"
        );
        assert_eq!(Match::DestinationPort { port: 5201 }.to_string(), "dport 5201");
        assert_eq!(
            Match::Protocol {
                protocol: TransportProtocol::Udp
            }
            .to_string(),
            "protocol udp"
        );
        assert_eq!(Match::Tos { value: 16 }.to_string(), "tos 0x10");
        assert_eq!(
            Match::Flow {
                handle: Handle::new(1, 0x10)
            }
            .to_string(),
            "flowid 1:10"
        );
    }

    #[test]
    fn match_payloads_round_trip_through_serde() {
        let matches = vec![
            Match::DestinationPort { port: 5201 },
            Match::SourcePortRange { start: 1000, end: 2000 },
            Match::Protocol {
                protocol: TransportProtocol::Other(47),
            },
        ];
        let json = serde_json::to_string(&matches).unwrap();
        let back: Vec<Match> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, matches);
    }
}
