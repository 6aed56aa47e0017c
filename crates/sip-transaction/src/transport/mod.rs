//! Transport façade.
//!
//! The core only ever asks for `send(msg, dest)`; demultiplexing inbound
//! datagrams/streams into `Message`s is the embedding application's job,
//! which then calls [`crate::TransactionManager::incoming_message`].

use async_trait::async_trait;
use sip_message::Message;
use std::fmt;

mod udp;

pub use udp::Udp;

/// Wire protocol a message was sent/received over. UDP is the default;
/// TCP is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Udp,
    Tcp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Proto::Udp => "UDP",
            Proto::Tcp => "TCP",
        })
    }
}

impl Proto {
    /// `true` for transports where the transport layer itself guarantees
    /// delivery, suppressing transaction-level retransmission: the INVITE
    /// CT does not arm timer A on reliable transports.
    pub fn reliable(self) -> bool {
        matches!(self, Proto::Tcp)
    }
}

/// `(host, port, proto)`, the unit the transport façade sends to and
/// messages are received from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub proto: Proto,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.proto)
    }
}

/// Fire-and-forget send sink; no callback blocks on I/O.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, msg: &Message, dest: &Destination) -> std::io::Result<()>;
}
