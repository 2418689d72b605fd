//! Commands and their handlers.
//!
//! Commands carry string-typed fields the way they arrive from
//! configuration or an API surface; handlers parse them into value
//! objects, load the aggregate from the event store, invoke the matching
//! mutator, and save. Handlers never touch aggregate state directly.

pub mod handlers;

use crate::error::{Error, Result};
use crate::model::{Cidr, Match, TransportProtocol};
use crate::util::{Bandwidth, DeviceName, Handle};

pub use handlers::CommandService;

/// Create an HTB qdisc on a device.
#[derive(Debug, Clone)]
pub struct AddHtbQdisc {
    pub device: String,
    pub handle: String,
    /// Absent means root.
    pub parent: Option<String>,
    pub default_class: String,
    pub r2q: Option<u32>,
}

/// Create a TBF qdisc on a device.
#[derive(Debug, Clone)]
pub struct AddTbfQdisc {
    pub device: String,
    pub handle: String,
    pub parent: Option<String>,
    pub rate: String,
    pub buffer: Option<u32>,
    pub limit: Option<u32>,
    pub burst: Option<u32>,
}

/// Create a PRIO qdisc on a device.
#[derive(Debug, Clone)]
pub struct AddPrioQdisc {
    pub device: String,
    pub handle: String,
    pub parent: Option<String>,
    pub bands: Option<u8>,
    pub priomap: Option<[u8; 16]>,
}

/// Create an FQ_CODEL qdisc on a device.
#[derive(Debug, Clone, Default)]
pub struct AddFqCodelQdisc {
    pub device: String,
    pub handle: String,
    pub parent: Option<String>,
    pub limit: Option<u32>,
    pub flows: Option<u32>,
    pub target_us: Option<u32>,
    pub interval_us: Option<u32>,
    pub quantum: Option<u32>,
    pub ecn: Option<bool>,
}

/// Delete a qdisc.
#[derive(Debug, Clone)]
pub struct DeleteQdisc {
    pub device: String,
    pub handle: String,
}

/// Create an HTB class.
#[derive(Debug, Clone)]
pub struct AddHtbClass {
    pub device: String,
    pub parent: String,
    pub handle: String,
    pub name: String,
    pub rate: String,
    pub ceil: String,
    pub priority: Option<u8>,
}

/// Change rate/ceil of a class.
#[derive(Debug, Clone)]
pub struct ChangeClass {
    pub device: String,
    pub handle: String,
    pub rate: String,
    pub ceil: String,
}

/// Change borrowing priority of a class.
#[derive(Debug, Clone)]
pub struct ChangeClassPriority {
    pub device: String,
    pub handle: String,
    pub priority: u8,
}

/// Delete a class.
#[derive(Debug, Clone)]
pub struct DeleteClass {
    pub device: String,
    pub handle: String,
}

/// Create a filter with an explicit match list.
#[derive(Debug, Clone)]
pub struct AddFilter {
    pub device: String,
    pub parent: String,
    pub priority: u16,
    pub handle: String,
    pub flow_id: String,
    /// "all", "ipv4" or "ipv6"; absent means all.
    pub protocol: Option<String>,
    pub matches: Vec<Match>,
}

/// Replace the matches and target of an existing filter.
#[derive(Debug, Clone)]
pub struct ModifyFilter {
    pub device: String,
    pub parent: String,
    pub priority: u16,
    pub handle: String,
    pub flow_id: String,
    pub matches: Vec<Match>,
}

/// Delete a filter.
#[derive(Debug, Clone)]
pub struct DeleteFilter {
    pub device: String,
    pub parent: String,
    pub priority: u16,
    pub handle: String,
}

/// Structured options for the advanced filter command. Each populated
/// field contributes one or more matches, all ANDed together.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Source networks in CIDR notation.
    pub source_cidrs: Vec<String>,
    /// Destination networks in CIDR notation.
    pub destination_cidrs: Vec<String>,
    /// Exact source ports.
    pub source_ports: Vec<u16>,
    /// Exact destination ports.
    pub destination_ports: Vec<u16>,
    /// Inclusive source port ranges.
    pub source_port_ranges: Vec<(u16, u16)>,
    /// Inclusive destination port ranges.
    pub destination_port_ranges: Vec<(u16, u16)>,
    /// Transport protocol by name or number.
    pub transport_protocol: Option<String>,
    /// Type-of-service byte.
    pub tos: Option<u8>,
    /// DSCP code point.
    pub dscp: Option<u8>,
}

impl FilterOptions {
    /// Expand the options into a match list. Anything unparseable is a
    /// validation error; nothing is silently dropped.
    pub fn into_matches(self) -> Result<Vec<Match>> {
        let mut matches = Vec::new();
        for cidr in &self.source_cidrs {
            matches.push(Match::SourceIp {
                cidr: Cidr::parse(cidr)?,
            });
        }
        for cidr in &self.destination_cidrs {
            matches.push(Match::DestinationIp {
                cidr: Cidr::parse(cidr)?,
            });
        }
        for &port in &self.source_ports {
            matches.push(Match::SourcePort { port });
        }
        for &port in &self.destination_ports {
            matches.push(Match::DestinationPort { port });
        }
        for &(start, end) in &self.source_port_ranges {
            matches.push(Match::SourcePortRange { start, end });
        }
        for &(start, end) in &self.destination_port_ranges {
            matches.push(Match::DestinationPortRange { start, end });
        }
        if let Some(protocol) = &self.transport_protocol {
            matches.push(Match::Protocol {
                protocol: TransportProtocol::parse(protocol)?,
            });
        }
        if let Some(value) = self.tos {
            matches.push(Match::Tos { value });
        }
        if let Some(value) = self.dscp {
            if value > 63 {
                return Err(Error::Validation(format!(
                    "invalid dscp: {value} exceeds 63"
                )));
            }
            matches.push(Match::Dscp { value });
        }
        Ok(matches)
    }
}

/// Create a filter from structured options.
#[derive(Debug, Clone)]
pub struct AddAdvancedFilter {
    pub device: String,
    pub parent: String,
    pub priority: u16,
    pub handle: String,
    pub flow_id: String,
    pub protocol: Option<String>,
    pub options: FilterOptions,
}

// ============================================================================
// Field parsing helpers
// ============================================================================

pub(crate) fn parse_device(value: &str) -> Result<DeviceName> {
    DeviceName::new(value).map_err(|err| Error::Validation(format!("invalid device: {err}")))
}

pub(crate) fn parse_handle_field(field: &str, value: &str) -> Result<Handle> {
    Handle::parse(value).map_err(|err| Error::Validation(format!("invalid {field}: {err}")))
}

pub(crate) fn parse_bandwidth_field(field: &str, value: &str) -> Result<Bandwidth> {
    Bandwidth::parse(value).map_err(|err| Error::Validation(format!("invalid {field}: {err}")))
}

pub(crate) fn parse_optional_parent(value: Option<&str>) -> Result<Option<Handle>> {
    value.map(|v| parse_handle_field("parent", v)).transpose()
}

pub(crate) fn parse_filter_protocol(value: Option<&str>) -> Result<crate::model::FilterProtocol> {
    use crate::model::FilterProtocol;
    Ok(match value {
        None => FilterProtocol::All,
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "all" => FilterProtocol::All,
            "ip" | "ipv4" => FilterProtocol::Ipv4,
            "ipv6" => FilterProtocol::Ipv6,
            other => {
                return Err(Error::Validation(format!(
                    "invalid protocol: {other:?} is not one of all, ipv4, ipv6"
                )));
            }
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_options_expand_in_stable_order() {
        let options = FilterOptions {
            source_cidrs: vec!["10.0.0.0/8".into()],
            destination_ports: vec![443, 8443],
            transport_protocol: Some("tcp".into()),
            ..Default::default()
        };
        let matches = options.into_matches().unwrap();
        assert_eq!(matches.len(), 4);
        assert!(matches!(matches[0], Match::SourceIp { .. }));
        assert!(matches!(matches[1], Match::DestinationPort { port: 443 }));
        assert!(matches!(matches[2], Match::DestinationPort { port: 8443 }));
        assert!(matches!(
            matches[3],
            Match::Protocol {
                protocol: TransportProtocol::Tcp
            }
        ));
    }

    #[test]
    fn bad_cidr_is_a_validation_error_not_a_silent_drop() {
        let options = FilterOptions {
            source_cidrs: vec!["999.0.0.0/8".into()],
            ..Default::default()
        };
        let err = options.into_matches().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn dscp_range_checked() {
        let options = FilterOptions {
            dscp: Some(64),
            ..Default::default()
        };
        assert!(options.into_matches().is_err());
    }

    #[test]
    fn protocol_field_parses() {
        assert!(parse_filter_protocol(None).is_ok());
        assert!(parse_filter_protocol(Some("IPv4")).is_ok());
        assert!(parse_filter_protocol(Some("ethernet")).is_err());
    }
}
