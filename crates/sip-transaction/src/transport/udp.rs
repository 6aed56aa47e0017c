//! `tokio::net::UdpSocket`-backed [`Transport`]: one datagram is one SIP
//! message, so there's no framing layer to speak of. TLS and the
//! WebSocket/TCP transports are not implemented here; `Transport` is a
//! trait so an embedding application can add them.

use super::{Destination, Proto, Transport};
use async_trait::async_trait;
use sip_message::Message;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Largest datagram this transport will attempt to read; larger ones are
/// truncated by `recv_from` itself and surfaced as a parse failure upstream.
const MAX_MSG_SIZE: usize = u16::MAX as usize;

/// A single bound UDP socket, usable both as a [`Transport`] (outbound) and
/// as the driver of a receive loop (inbound) that feeds a caller-supplied
/// sink — typically `TransactionManager::incoming_message`.
#[derive(Debug)]
pub struct Udp {
    socket: UdpSocket,
    bound: SocketAddr,
}

impl Udp {
    /// Binds a UDP socket to `addr`.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        let bound = socket.local_addr()?;
        log::info!("bound UDP transport to {bound}");
        Ok(Arc::new(Udp { socket, bound }))
    }

    pub fn bound(&self) -> SocketAddr {
        self.bound
    }

    /// Runs the receive loop until the socket errors or the task is
    /// dropped: reads a datagram, parses it as a [`Message`] and hands it
    /// to `on_message` with the peer as [`Destination`]. Malformed
    /// datagrams are logged and dropped, with no transaction-level effect.
    pub async fn run_recv_loop(self: Arc<Self>, on_message: impl Fn(Message, Destination) + Send + 'static) {
        let mut buffer = vec![0u8; MAX_MSG_SIZE];

        loop {
            let (len, peer) = match self.socket.recv_from(&mut buffer).await {
                Ok(result) => result,
                Err(err) => {
                    log::error!("UDP recv error on {}: {err}", self.bound);
                    return;
                }
            };

            let bytes = &buffer[..len];
            if bytes.is_empty() {
                // RFC 3261 §18.1.1 keep-alive: bare CRLF datagram, not a
                // message; nothing to parse or report.
                continue;
            }

            match Message::parse(bytes) {
                Ok(msg) => on_message(
                    msg,
                    Destination {
                        host: peer.ip().to_string(),
                        port: peer.port(),
                        proto: Proto::Udp,
                    },
                ),
                Err(err) => log::warn!("dropping malformed UDP datagram from {peer}: {err}"),
            }
        }
    }
}

#[async_trait]
impl Transport for Udp {
    async fn send(&self, msg: &Message, dest: &Destination) -> io::Result<()> {
        let bytes = msg.to_string().into_bytes();
        self.socket.send_to(&bytes, (dest.host.as_str(), dest.port)).await?;
        Ok(())
    }
}
