//! Message builder for constructing netlink requests.

use super::attr::{NLA_F_NESTED, NlAttr, nla_align};
use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};

/// Token returned when starting a nested attribute; finalizes the
/// nested length on `nest_end`.
#[derive(Debug, Clone, Copy)]
pub struct NestToken {
    offset: usize,
}

/// Builder for one outgoing netlink message.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    /// Create a new message builder with the given type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let header = NlMsgHdr::new(msg_type, flags);
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[..std::mem::size_of::<NlMsgHdr>()].copy_from_slice(header.as_bytes());
        Self { buf }
    }

    /// Append raw bytes (with alignment padding).
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a fixed-size `repr(C)` struct.
    pub fn append<T: Copy>(&mut self, data: &T) {
        let bytes = unsafe {
            std::slice::from_raw_parts(data as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.append_bytes(bytes);
    }

    /// Append an attribute with the given type and payload.
    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) {
        let attr = NlAttr::new(attr_type, data.len());
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a native-endian u32 attribute.
    pub fn append_attr_u32(&mut self, attr_type: u16, value: u32) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a native-endian u64 attribute.
    pub fn append_attr_u64(&mut self, attr_type: u16, value: u64) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a NUL-terminated string attribute.
    pub fn append_attr_str(&mut self, attr_type: u16, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.append_attr(attr_type, &data);
    }

    /// Start a nested attribute. Returns a token for `nest_end`.
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.buf.len();
        let attr = NlAttr::new(attr_type | NLA_F_NESTED, 0);
        self.buf.extend_from_slice(attr.as_bytes());
        NestToken { offset }
    }

    /// Finalize a nested attribute started with `nest_start`.
    pub fn nest_end(&mut self, token: NestToken) {
        let len = self.buf.len() - token.offset;
        let len_bytes = (len as u16).to_ne_bytes();
        self.buf[token.offset] = len_bytes[0];
        self.buf[token.offset + 1] = len_bytes[1];
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Set the port ID.
    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Finalize: fix up the total length and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }

    /// Inspect the buffer without finalizing.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::{AttrIter, NLA_HDRLEN};
    use crate::netlink::message::{NLM_F_REQUEST, NlMsgHdr};

    #[test]
    fn finish_fixes_length() {
        let mut builder = MessageBuilder::new(36, NLM_F_REQUEST);
        builder.append_attr_u32(1, 0x1234_5678);
        let msg = builder.finish();

        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_len as usize, msg.len());
        assert!(msg.len() >= NLMSG_HDRLEN + NLA_HDRLEN + 4);
    }

    #[test]
    fn nested_attribute_length_updates() {
        let mut builder = MessageBuilder::new(36, NLM_F_REQUEST);
        let nest = builder.nest_start(2);
        builder.append_attr_u32(5, 100);
        builder.nest_end(nest);
        let msg = builder.finish();

        let attrs: Vec<(u16, Vec<u8>)> = AttrIter::new(&msg[NLMSG_HDRLEN..])
            .map(|(t, d)| (t, d.to_vec()))
            .collect();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].0, 2);
        // The nested payload itself holds attribute 5.
        let inner: Vec<u16> = AttrIter::new(&attrs[0].1).map(|(t, _)| t).collect();
        assert_eq!(inner, vec![5]);
    }

    #[test]
    fn string_attrs_are_nul_terminated() {
        let mut builder = MessageBuilder::new(36, NLM_F_REQUEST);
        builder.append_attr_str(1, "htb");
        let msg = builder.finish();
        let (_, payload) = AttrIter::new(&msg[NLMSG_HDRLEN..]).next().unwrap();
        assert_eq!(payload, b"htb\0");
    }
}
