//! HTB class option marshalling.

use super::builder::MessageBuilder;
use super::types::{TcRateSpec, htb};
use crate::model::HtbClass;

/// Microseconds per second: tc time units for buffer computation.
const TIME_UNITS_PER_SEC: u64 = 1_000_000;

/// Write the TCA_OPTIONS payload for an HTB class. The nest is opened
/// and closed by the caller.
pub fn write_htb_class_options(builder: &mut MessageBuilder, class: &HtbClass) {
    let rate_bytes = class.rate.bytes_per_second();
    let ceil_bytes = class.ceil.bytes_per_second();

    let buffer = ticks_for(class.burst, rate_bytes);
    let cbuffer = ticks_for(class.cburst, ceil_bytes);

    let opt = htb::TcHtbOpt {
        rate: TcRateSpec {
            rate: rate_bytes.min(u32::MAX as u64) as u32,
            mpu: class.mpu,
            overhead: class.overhead,
            ..Default::default()
        },
        ceil: TcRateSpec {
            rate: ceil_bytes.min(u32::MAX as u64) as u32,
            mpu: class.mpu,
            overhead: class.overhead,
            ..Default::default()
        },
        buffer,
        cbuffer,
        quantum: class.quantum.unwrap_or(0),
        prio: class.htb_prio,
        ..Default::default()
    };

    if rate_bytes > u32::MAX as u64 {
        builder.append_attr(htb::TCA_HTB_RATE64, &rate_bytes.to_ne_bytes());
    }
    if ceil_bytes > u32::MAX as u64 {
        builder.append_attr(htb::TCA_HTB_CEIL64, &ceil_bytes.to_ne_bytes());
    }

    builder.append_attr(htb::TCA_HTB_PARMS, opt.as_bytes());
    builder.append_attr(htb::TCA_HTB_RTAB, &rate_table(rate_bytes, class.mtu));
    builder.append_attr(htb::TCA_HTB_CTAB, &rate_table(ceil_bytes, class.mtu));
}

/// Convert a burst size in bytes to time units at the given rate.
fn ticks_for(burst: u32, rate_bytes: u64) -> u32 {
    if rate_bytes == 0 {
        return burst;
    }
    ((burst as u64 * TIME_UNITS_PER_SEC) / rate_bytes).min(u32::MAX as u64) as u32
}

/// Transmission-time lookup table the kernel uses for size-to-time
/// conversion (256 cells of 8 bytes each).
fn rate_table(rate_bytes: u64, mtu: u32) -> [u8; 1024] {
    let mut table = [0u8; 1024];
    if rate_bytes == 0 {
        return table;
    }

    let cell_log: u32 = 3;
    let cell_size = 1u32 << cell_log;

    for i in 0..256 {
        let size = (((i + 1) as u32) * cell_size).min(mtu);
        let time = ((size as u64 * TIME_UNITS_PER_SEC) / rate_bytes).min(u32::MAX as u64) as u32;
        table[i * 4..i * 4 + 4].copy_from_slice(&time.to_ne_bytes());
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HtbClass;
    use crate::netlink::attr::AttrIter;
    use crate::netlink::message::{NLM_F_REQUEST, NLMSG_HDRLEN, NlMsgType};
    use crate::util::{Bandwidth, DeviceName, Handle};

    fn class() -> HtbClass {
        HtbClass::new(
            DeviceName::new("eth0").unwrap(),
            Handle::new(1, 0),
            Handle::new(1, 0x10),
            "default",
            Bandwidth::from_mbps(8),
            Bandwidth::from_mbps(16),
            2,
        )
        .unwrap()
    }

    #[test]
    fn parms_carry_rates_in_bytes_and_priority() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWTCLASS, NLM_F_REQUEST);
        write_htb_class_options(&mut builder, &class());
        let msg = builder.finish();

        let parms = AttrIter::new(&msg[NLMSG_HDRLEN..])
            .find(|(t, _)| *t == htb::TCA_HTB_PARMS)
            .map(|(_, d)| d.to_vec())
            .expect("TCA_HTB_PARMS present");

        // rate ratespec at 0..12, ceil at 12..24
        let rate = u32::from_ne_bytes(parms[8..12].try_into().unwrap());
        let ceil = u32::from_ne_bytes(parms[20..24].try_into().unwrap());
        assert_eq!(rate, 1_000_000); // 8 Mbps
        assert_eq!(ceil, 2_000_000); // 16 Mbps
        // prio is the last u32 of tc_htb_opt
        let prio = u32::from_ne_bytes(parms[40..44].try_into().unwrap());
        assert_eq!(prio, 2);
    }

    #[test]
    fn rate_tables_are_present_and_sized() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWTCLASS, NLM_F_REQUEST);
        write_htb_class_options(&mut builder, &class());
        let msg = builder.finish();

        let lens: Vec<(u16, usize)> = AttrIter::new(&msg[NLMSG_HDRLEN..])
            .map(|(t, d)| (t, d.len()))
            .collect();
        assert!(lens.contains(&(htb::TCA_HTB_RTAB, 1024)));
        assert!(lens.contains(&(htb::TCA_HTB_CTAB, 1024)));
    }

    #[test]
    fn tick_conversion() {
        // 1000 bytes at 1_000_000 B/s is 1000 time units.
        assert_eq!(ticks_for(1000, 1_000_000), 1000);
        assert_eq!(ticks_for(1000, 0), 1000);
    }
}
