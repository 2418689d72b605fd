//! NETEM parameter marshalling.
//!
//! Only the wire encoding lives here: delay and jitter travel in
//! microseconds, probabilities as kernel fixed point where percentage p
//! becomes `(p/100) * u32::MAX`. Scheduling semantics are out of scope.

use super::builder::MessageBuilder;
use super::types::netem::{
    TCA_NETEM_CORRUPT, TCA_NETEM_LATENCY64, TCA_NETEM_JITTER64, TCA_NETEM_REORDER, TcNetemCorrupt,
    TcNetemQopt, TcNetemReorder, percent_to_prob,
};

/// NETEM impairment parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct NetemOptions {
    /// Added delay in microseconds.
    pub delay_us: u32,
    /// Delay jitter in microseconds.
    pub jitter_us: u32,
    /// Loss percentage (0-100).
    pub loss_pct: f64,
    /// Duplication percentage (0-100).
    pub duplicate_pct: f64,
    /// Corruption percentage (0-100).
    pub corrupt_pct: f64,
    /// Reorder percentage (0-100).
    pub reorder_pct: f64,
    /// Reorder gap in packets.
    pub gap: u32,
    /// Queue limit in packets.
    pub limit: u32,
}

impl Default for NetemOptions {
    fn default() -> Self {
        Self {
            delay_us: 0,
            jitter_us: 0,
            loss_pct: 0.0,
            duplicate_pct: 0.0,
            corrupt_pct: 0.0,
            reorder_pct: 0.0,
            gap: 0,
            limit: 1_000,
        }
    }
}

impl NetemOptions {
    /// Write the TCA_OPTIONS payload for a netem qdisc. The nest is
    /// opened and closed by the caller.
    pub fn write_options(&self, builder: &mut MessageBuilder) {
        let qopt = TcNetemQopt {
            latency: self.delay_us,
            limit: self.limit,
            loss: percent_to_prob(self.loss_pct),
            gap: if self.reorder_pct > 0.0 && self.gap == 0 {
                1
            } else {
                self.gap
            },
            duplicate: percent_to_prob(self.duplicate_pct),
            jitter: self.jitter_us,
        };
        builder.append(&qopt);

        // 64-bit nanosecond variants give the kernel full precision.
        if self.delay_us > 0 {
            let ns = (self.delay_us as i64) * 1_000;
            builder.append_attr(TCA_NETEM_LATENCY64, &ns.to_ne_bytes());
        }
        if self.jitter_us > 0 {
            let ns = (self.jitter_us as i64) * 1_000;
            builder.append_attr(TCA_NETEM_JITTER64, &ns.to_ne_bytes());
        }

        if self.reorder_pct > 0.0 {
            let reorder = TcNetemReorder {
                probability: percent_to_prob(self.reorder_pct),
                correlation: 0,
            };
            builder.append_attr(TCA_NETEM_REORDER, reorder.as_bytes());
        }

        if self.corrupt_pct > 0.0 {
            let corrupt = TcNetemCorrupt {
                probability: percent_to_prob(self.corrupt_pct),
                correlation: 0,
            };
            builder.append_attr(TCA_NETEM_CORRUPT, corrupt.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::AttrIter;
    use crate::netlink::message::{NLM_F_REQUEST, NLMSG_HDRLEN, NlMsgType};

    fn marshal(options: &NetemOptions) -> Vec<u8> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWQDISC, NLM_F_REQUEST);
        options.write_options(&mut builder);
        builder.finish()[NLMSG_HDRLEN..].to_vec()
    }

    #[test]
    fn qopt_carries_micros_and_fixed_point() {
        let options = NetemOptions {
            delay_us: 100_000,
            jitter_us: 10_000,
            loss_pct: 50.0,
            ..Default::default()
        };
        let bytes = marshal(&options);

        // tc_netem_qopt: latency, limit, loss, gap, duplicate, jitter
        let latency = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
        let loss = u32::from_ne_bytes(bytes[8..12].try_into().unwrap());
        let jitter = u32::from_ne_bytes(bytes[20..24].try_into().unwrap());
        assert_eq!(latency, 100_000);
        assert_eq!(jitter, 10_000);
        assert!((loss as f64 / u32::MAX as f64 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn reorder_defaults_gap_to_one() {
        let options = NetemOptions {
            delay_us: 1_000,
            reorder_pct: 25.0,
            ..Default::default()
        };
        let bytes = marshal(&options);
        let gap = u32::from_ne_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(gap, 1);

        let attrs: Vec<u16> = AttrIter::new(&bytes[TcNetemQopt::SIZE..]).map(|(t, _)| t).collect();
        assert!(attrs.contains(&TCA_NETEM_REORDER));
    }

    #[test]
    fn corrupt_probability_attr_present() {
        let options = NetemOptions {
            corrupt_pct: 1.0,
            ..Default::default()
        };
        let bytes = marshal(&options);
        let attrs: Vec<u16> = AttrIter::new(&bytes[TcNetemQopt::SIZE..]).map(|(t, _)| t).collect();
        assert_eq!(attrs, vec![TCA_NETEM_CORRUPT]);
    }
}
