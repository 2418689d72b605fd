//! Declarative shaping plans.
//!
//! The serde shape consumed by external configuration loaders. File
//! formats and I/O stay outside the crate; anything that deserializes
//! into [`ShapingPlan`] can be validated and compiled onto the fluent
//! controller.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shaping::NetworkInterface;

/// Default ratio between a class's ceiling and its guaranteed rate when
/// no explicit maximum is declared.
fn default_burst_ratio() -> f64 {
    1.5
}

/// A complete declarative configuration for one interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapingPlan {
    /// Schema version string.
    pub version: String,
    /// Interface name.
    pub device: String,
    /// Total bandwidth budget, e.g. `"1gbps"`.
    pub bandwidth: String,
    /// Plan-wide defaults.
    #[serde(default)]
    pub defaults: PlanDefaults,
    /// Traffic classes, possibly nested.
    pub classes: Vec<PlanClass>,
    /// Classification rules.
    #[serde(default)]
    pub rules: Vec<PlanRule>,
}

/// Plan-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefaults {
    /// Ceiling multiplier applied when a class declares no maximum.
    #[serde(default = "default_burst_ratio")]
    pub burst_ratio: f64,
}

impl Default for PlanDefaults {
    fn default() -> Self {
        Self {
            burst_ratio: default_burst_ratio(),
        }
    }
}

/// One traffic class declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanClass {
    /// Class name; children are addressed as `parent.child`.
    pub name: String,
    /// Parent class name, for flat declarations of nested classes.
    #[serde(default)]
    pub parent: Option<String>,
    /// Guaranteed rate, e.g. `"100mbps"`.
    pub guaranteed: String,
    /// Optional ceiling; defaults to guaranteed x burst_ratio.
    #[serde(default)]
    pub maximum: Option<String>,
    /// Priority 0-7. Required; validation rejects a missing value.
    #[serde(default)]
    pub priority: Option<u8>,
    /// Nested child classes.
    #[serde(default)]
    pub children: Vec<PlanClass>,
}

/// One classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRule {
    /// Rule name, for diagnostics.
    pub name: String,
    /// Packet predicates.
    #[serde(rename = "match")]
    pub matches: PlanMatch,
    /// Dotted name of the target class.
    pub target: String,
    /// Rule precedence.
    pub priority: u16,
}

/// Predicates of one rule. All populated fields AND together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMatch {
    /// Source network in CIDR notation.
    #[serde(default)]
    pub source_ip: Option<String>,
    /// Destination network in CIDR notation.
    #[serde(default)]
    pub destination_ip: Option<String>,
    /// Source ports.
    #[serde(default)]
    pub source_port: Vec<u16>,
    /// Destination ports.
    #[serde(default)]
    pub dest_port: Vec<u16>,
    /// Transport protocol name or number.
    #[serde(default)]
    pub protocol: Option<String>,
    /// Well-known application names expanded to destination ports.
    #[serde(default)]
    pub application: Vec<String>,
}

/// Destination ports for the application names the plan schema accepts.
fn application_ports(name: &str) -> Option<&'static [u16]> {
    Some(match name {
        "http" => &[80],
        "https" => &[443],
        "dns" => &[53],
        "ssh" => &[22],
        "smtp" => &[25, 587],
        "imap" => &[143, 993],
        "rtp" => &[5004],
        "sip" => &[5060, 5061],
        _ => return None,
    })
}

impl ShapingPlan {
    /// Dotted names of every class, depth first.
    fn class_names(&self) -> Vec<String> {
        fn walk(classes: &[PlanClass], prefix: &str, out: &mut Vec<String>) {
            for class in classes {
                let name = if prefix.is_empty() {
                    class.name.clone()
                } else {
                    format!("{prefix}.{}", class.name)
                };
                walk(&class.children, &name, out);
                out.push(name);
            }
        }
        let mut names = Vec::new();
        walk(&self.classes, "", &mut names);
        names
    }

    /// Validate the plan: unique dotted names, resolvable rule targets,
    /// explicit priorities everywhere.
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(Error::Validation("device required".into()));
        }

        let names = self.class_names();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != names.len() {
            let mut seen = std::collections::HashSet::new();
            for name in &names {
                if !seen.insert(name) {
                    return Err(Error::Validation(format!(
                        "duplicate class name {name:?}"
                    )));
                }
            }
        }

        fn check_priorities(classes: &[PlanClass]) -> Result<()> {
            for class in classes {
                match class.priority {
                    None => {
                        return Err(Error::Validation(format!(
                            "class {:?} has no priority set",
                            class.name
                        )));
                    }
                    Some(p) if p > 7 => {
                        return Err(Error::Validation(format!(
                            "class {:?}: priority must be 0-7, got {p}",
                            class.name
                        )));
                    }
                    Some(_) => {}
                }
                check_priorities(&class.children)?;
            }
            Ok(())
        }
        check_priorities(&self.classes)?;

        for rule in &self.rules {
            if !names.iter().any(|n| n == &rule.target) {
                return Err(Error::Validation(format!(
                    "rule {:?}: target class {:?} does not exist",
                    rule.name, rule.target
                )));
            }
            for app in &rule.matches.application {
                if application_ports(app).is_none() {
                    return Err(Error::Validation(format!(
                        "rule {:?}: unknown application {app:?}",
                        rule.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Compile the plan onto a fluent controller.
    ///
    /// Nested children flatten into the controller's single HTB tier
    /// using their dotted names; the priority-to-handle mapping needs
    /// priorities to be unique across the whole plan, which `apply`
    /// enforces.
    pub fn compile(&self) -> Result<NetworkInterface> {
        self.validate()?;

        let mut controller =
            NetworkInterface::new(&self.device)?.with_hard_limit_bandwidth(&self.bandwidth)?;

        // Flatten classes depth first, carrying dotted names.
        fn flatten(classes: &[PlanClass], prefix: &str, out: &mut Vec<(String, PlanClass)>) {
            for class in classes {
                let name = if prefix.is_empty() {
                    class.name.clone()
                } else {
                    format!("{prefix}.{}", class.name)
                };
                out.push((name.clone(), class.clone()));
                flatten(&class.children, &name, out);
            }
        }
        let mut flat = Vec::new();
        flatten(&self.classes, "", &mut flat);

        for (dotted_name, class) in &flat {
            let mut builder = controller
                .create_traffic_class(dotted_name)
                .with_guaranteed_bandwidth(&class.guaranteed)?;

            let maximum = match &class.maximum {
                Some(maximum) => maximum.clone(),
                None => {
                    // Scale the guaranteed rate by the burst ratio.
                    let guaranteed = crate::util::Bandwidth::parse(&class.guaranteed)?;
                    let pct = (self.defaults.burst_ratio * 100.0).round() as u64;
                    guaranteed.percent(pct).to_string()
                }
            };
            builder = builder.with_soft_limit_bandwidth(&maximum)?;

            if let Some(priority) = class.priority {
                builder = builder.with_priority(priority);
            }

            for rule in self.rules.iter().filter(|r| &r.target == dotted_name) {
                if let Some(cidr) = &rule.matches.source_ip {
                    builder = builder.for_source_ips(&[cidr.as_str()])?;
                }
                if let Some(cidr) = &rule.matches.destination_ip {
                    builder = builder.for_destination_ips(&[cidr.as_str()])?;
                }
                for &port in &rule.matches.source_port {
                    builder = builder.for_source_port(port);
                }
                for &port in &rule.matches.dest_port {
                    builder = builder.for_port(port);
                }
                for app in &rule.matches.application {
                    // Unknown applications were rejected by validate().
                    if let Some(ports) = application_ports(app) {
                        for &port in ports {
                            builder = builder.for_port(port);
                        }
                    }
                }
                if let Some(protocol) = &rule.matches.protocol {
                    builder = builder.for_protocols(&[protocol.as_str()])?;
                }
            }

            controller = builder.done();
        }

        Ok(controller)
    }
}
