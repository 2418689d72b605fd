//! Police action marshalling.
//!
//! A policer bounds the rate of traffic matched by a filter. The
//! parameters travel as a nested TCA_U32_POLICE attribute holding a
//! `tc_police` struct plus rate tables.

use std::fmt;
use std::str::FromStr;

use super::builder::MessageBuilder;
use super::types::filter::u32::TCA_U32_POLICE;
use super::types::{TcRateSpec, police};
use crate::error::{Error, Result};

/// Time units per second used for burst-to-ticks conversion.
const TIME_UNITS_PER_SEC: u64 = 1_000_000;

/// What happens to packets exceeding the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceedAction {
    /// Drop the packet.
    #[default]
    Drop,
    /// Let it through.
    Pass,
    /// Re-run classification.
    Reclassify,
    /// Continue with the next filter.
    Continue,
    /// Hand over to the next action.
    Pipe,
}

impl ExceedAction {
    /// Kernel TC_POLICE_* decision value.
    pub fn kernel_value(self) -> i32 {
        match self {
            Self::Drop => police::TC_POLICE_SHOT,
            Self::Pass => police::TC_POLICE_OK,
            Self::Reclassify => police::TC_POLICE_RECLASSIFY,
            Self::Continue => police::TC_POLICE_UNSPEC,
            Self::Pipe => police::TC_POLICE_PIPE,
        }
    }
}

impl fmt::Display for ExceedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Drop => "drop",
            Self::Pass => "pass",
            Self::Reclassify => "reclassify",
            Self::Continue => "continue",
            Self::Pipe => "pipe",
        };
        f.write_str(name)
    }
}

impl FromStr for ExceedAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "drop" | "shot" => Self::Drop,
            "pass" | "ok" => Self::Pass,
            "reclassify" => Self::Reclassify,
            "continue" => Self::Continue,
            "pipe" => Self::Pipe,
            other => {
                return Err(Error::Validation(format!(
                    "invalid exceed-action {other:?}: must be drop, pass, reclassify, continue or pipe"
                )));
            }
        })
    }
}

/// Police parameters for a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoliceSpec {
    /// Rate bound in bytes per second.
    pub rate_bytes: u64,
    /// Burst allowance in bytes.
    pub burst: u32,
    /// Largest packet the policer accounts for.
    pub mtu: u32,
    /// Decision for packets above the rate.
    pub exceed_action: ExceedAction,
    /// Optional peak rate in bytes per second.
    pub peak_rate_bytes: Option<u64>,
}

impl PoliceSpec {
    /// Build a spec with a rate and burst, defaulting the rest.
    pub fn new(rate_bytes: u64, burst: u32) -> Self {
        Self {
            rate_bytes,
            burst,
            mtu: 2048,
            exceed_action: ExceedAction::Drop,
            peak_rate_bytes: None,
        }
    }

    /// Validate the rate bounds: the tc_police ratespec is 32 bits.
    pub fn validate(&self) -> Result<()> {
        if self.rate_bytes > u32::MAX as u64 {
            return Err(Error::Validation(format!(
                "police rate {} bytes/sec exceeds the 32-bit rate limit",
                self.rate_bytes
            )));
        }
        if let Some(peak) = self.peak_rate_bytes
            && peak > u32::MAX as u64
        {
            return Err(Error::Validation(format!(
                "police peak rate {peak} bytes/sec exceeds the 32-bit rate limit"
            )));
        }
        if self.rate_bytes == 0 {
            return Err(Error::Validation("police rate must be non-zero".into()));
        }
        Ok(())
    }

    /// Write the nested TCA_U32_POLICE attribute.
    pub fn write(&self, builder: &mut MessageBuilder) -> Result<()> {
        self.validate()?;

        let burst_ticks =
            ((self.burst as u64 * TIME_UNITS_PER_SEC) / self.rate_bytes).min(u32::MAX as u64) as u32;

        let parms = police::TcPolice {
            action: self.exceed_action.kernel_value(),
            burst: burst_ticks,
            mtu: self.mtu,
            rate: TcRateSpec::new(self.rate_bytes as u32),
            peakrate: self
                .peak_rate_bytes
                .map(|p| TcRateSpec::new(p as u32))
                .unwrap_or_default(),
            ..Default::default()
        };

        let nest = builder.nest_start(TCA_U32_POLICE);
        builder.append_attr(police::TCA_POLICE_TBF, parms.as_bytes());
        builder.append_attr(police::TCA_POLICE_RATE, &rate_table(self.rate_bytes, self.mtu));
        if let Some(peak) = self.peak_rate_bytes {
            builder.append_attr(police::TCA_POLICE_PEAKRATE, &rate_table(peak, self.mtu));
        }
        builder.nest_end(nest);
        Ok(())
    }
}

/// Size-to-time lookup table, same shape the HTB class marshalling uses.
fn rate_table(rate_bytes: u64, mtu: u32) -> [u8; 1024] {
    let mut table = [0u8; 1024];
    if rate_bytes == 0 {
        return table;
    }
    let cell_size = 8u32;
    for i in 0..256 {
        let size = (((i + 1) as u32) * cell_size).min(mtu);
        let time =
            ((size as u64 * TIME_UNITS_PER_SEC) / rate_bytes).min(u32::MAX as u64) as u32;
        table[i * 4..i * 4 + 4].copy_from_slice(&time.to_ne_bytes());
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::AttrIter;
    use crate::netlink::message::{NLM_F_REQUEST, NLMSG_HDRLEN, NlMsgType};

    #[test]
    fn exceed_actions_map_to_kernel_values() {
        assert_eq!(ExceedAction::Drop.kernel_value(), 2);
        assert_eq!(ExceedAction::Pass.kernel_value(), 0);
        assert_eq!(ExceedAction::Reclassify.kernel_value(), 1);
        assert_eq!(ExceedAction::Continue.kernel_value(), -1);
        assert_eq!(ExceedAction::Pipe.kernel_value(), 3);
        assert_eq!("drop".parse::<ExceedAction>().unwrap(), ExceedAction::Drop);
        assert!("explode".parse::<ExceedAction>().is_err());
    }

    #[test]
    fn oversized_rate_rejected() {
        let spec = PoliceSpec::new(u32::MAX as u64 + 1, 32_768);
        assert!(spec.validate().is_err());

        let mut peak = PoliceSpec::new(1_000_000, 32_768);
        peak.peak_rate_bytes = Some(u32::MAX as u64 + 1);
        assert!(peak.validate().is_err());
    }

    #[test]
    fn police_attribute_nests_parms_and_tables() {
        let mut spec = PoliceSpec::new(125_000, 10_000);
        spec.peak_rate_bytes = Some(250_000);

        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWTFILTER, NLM_F_REQUEST);
        spec.write(&mut builder).unwrap();
        let msg = builder.finish();

        let (attr_type, nested) = AttrIter::new(&msg[NLMSG_HDRLEN..]).next().unwrap();
        assert_eq!(attr_type, TCA_U32_POLICE);

        let inner: Vec<(u16, usize)> = AttrIter::new(nested).map(|(t, d)| (t, d.len())).collect();
        assert_eq!(inner[0].0, police::TCA_POLICE_TBF);
        assert_eq!(inner[0].1, police::TcPolice::SIZE);
        assert!(inner.contains(&(police::TCA_POLICE_RATE, 1024)));
        assert!(inner.contains(&(police::TCA_POLICE_PEAKRATE, 1024)));
    }

    #[test]
    fn burst_converts_to_ticks() {
        // 10_000 bytes at 125_000 B/s -> 80_000 time units. Check via
        // the serialized tc_police.burst field (offset 12).
        let spec = PoliceSpec::new(125_000, 10_000);
        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWTFILTER, NLM_F_REQUEST);
        spec.write(&mut builder).unwrap();
        let msg = builder.finish();
        let (_, nested) = AttrIter::new(&msg[NLMSG_HDRLEN..]).next().unwrap();
        let (_, parms) = AttrIter::new(nested).next().unwrap();
        let burst = u32::from_ne_bytes(parms[12..16].try_into().unwrap());
        assert_eq!(burst, 80_000);
    }
}
