//! Request/response plumbing over one netlink socket.

use super::builder::MessageBuilder;
use super::message::{
    MessageIter, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST, NlMsgError,
};
use super::socket::NetlinkSocket;
use crate::error::{Error, Result};

/// A connection to the rtnetlink subsystem.
pub struct Connection {
    socket: NetlinkSocket,
}

impl Connection {
    /// Open a new NETLINK_ROUTE connection.
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new()?,
        })
    }

    /// Send a request that expects an ACK only.
    pub async fn request_ack(&self, mut builder: MessageBuilder) -> Result<()> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());

        self.socket.send(&builder.finish()).await?;

        let response = self.socket.recv_msg().await?;
        for result in MessageIter::new(&response) {
            let (header, payload) = result?;
            if header.nlmsg_seq != seq {
                continue;
            }
            if header.is_error() {
                let err = NlMsgError::from_bytes(payload)?;
                if !err.is_ack() {
                    return Err(Error::from_errno(err.error));
                }
                return Ok(());
            }
        }
        Err(Error::InvalidMessage("expected ACK message".into()))
    }

    /// Send a dump request and collect every response message.
    pub async fn request_dump(&self, mut builder: MessageBuilder) -> Result<Vec<Vec<u8>>> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());

        self.socket.send(&builder.finish()).await?;

        let mut responses = Vec::new();
        loop {
            let data = self.socket.recv_msg().await?;
            let mut done = false;

            for result in MessageIter::new(&data) {
                let (header, payload) = result?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if !err.is_ack() {
                        return Err(Error::from_errno(err.error));
                    }
                }
                if header.is_done() {
                    done = true;
                    break;
                }
                responses.push(payload.to_vec());
            }

            if done {
                break;
            }
        }
        Ok(responses)
    }
}

/// Build a request expecting an ACK.
pub(crate) fn ack_request(msg_type: u16) -> MessageBuilder {
    MessageBuilder::new(msg_type, NLM_F_REQUEST | NLM_F_ACK)
}

/// Build a create request (fails on existing objects).
pub(crate) fn create_request(msg_type: u16) -> MessageBuilder {
    MessageBuilder::new(msg_type, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL)
}

/// Build a dump request.
pub(crate) fn dump_request(msg_type: u16) -> MessageBuilder {
    MessageBuilder::new(msg_type, NLM_F_REQUEST | NLM_F_DUMP)
}

/// Resolve an interface name to its index via sysfs.
pub(crate) fn ifname_to_index(name: &str) -> Result<i32> {
    let path = format!("/sys/class/net/{name}/ifindex");
    let content = std::fs::read_to_string(&path).map_err(|_| Error::InterfaceNotFound {
        name: name.to_string(),
    })?;
    content
        .trim()
        .parse()
        .map_err(|_| Error::InvalidMessage(format!("invalid ifindex for {name}")))
}
