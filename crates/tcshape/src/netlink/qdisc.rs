//! Qdisc option marshalling.
//!
//! Translates [`Qdisc`] entities into the TLV payloads the kernel
//! expects under TCA_OPTIONS. Rates cross into bytes/sec here; callers
//! stay in bits/sec.

use super::builder::MessageBuilder;
use super::types::{TcRateSpec, fq_codel, htb, prio, tbf};
use crate::model::Qdisc;

/// Write the TCA_OPTIONS payload for a qdisc. The nest is opened and
/// closed by the caller.
pub fn write_qdisc_options(builder: &mut MessageBuilder, qdisc: &Qdisc) {
    match qdisc {
        Qdisc::Htb { params, .. } => {
            let glob = htb::TcHtbGlob {
                version: 3,
                rate2quantum: params.r2q,
                defcls: params.default_class.minor as u32,
                ..Default::default()
            };
            builder.append_attr(htb::TCA_HTB_INIT, glob.as_bytes());
        }
        Qdisc::Tbf { params, .. } => {
            let rate_bytes = params.rate.bytes_per_second();
            let qopt = tbf::TcTbfQopt {
                rate: TcRateSpec::new(rate_bytes.min(u32::MAX as u64) as u32),
                peakrate: TcRateSpec::default(),
                limit: params.limit,
                buffer: params.buffer,
                mtu: params.burst,
            };
            builder.append_attr(tbf::TCA_TBF_PARMS, qopt.as_bytes());
            if rate_bytes > u32::MAX as u64 {
                builder.append_attr(tbf::TCA_TBF_RATE64, &rate_bytes.to_ne_bytes());
            }
        }
        Qdisc::Prio { params, .. } => {
            let qopt = prio::TcPrioQopt {
                bands: params.bands as i32,
                priomap: params.priomap,
            };
            builder.append(&qopt);
        }
        Qdisc::FqCodel { params, .. } => {
            builder.append_attr_u32(fq_codel::TCA_FQ_CODEL_LIMIT, params.limit);
            builder.append_attr_u32(fq_codel::TCA_FQ_CODEL_TARGET, params.target_us);
            builder.append_attr_u32(fq_codel::TCA_FQ_CODEL_INTERVAL, params.interval_us);
            builder.append_attr_u32(fq_codel::TCA_FQ_CODEL_QUANTUM, params.quantum);
            builder.append_attr_u32(fq_codel::TCA_FQ_CODEL_FLOWS, params.flows);
            if params.ecn {
                builder.append_attr_u32(fq_codel::TCA_FQ_CODEL_ECN, 1);
            }
        }
    }
}
