//! Datagram channel over a shared tokio UDP socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::{RelStreamError, Result};
use crate::transport::Channel;

/// Sends to one fixed peer through a socket shared by every connection of
/// an endpoint.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    closed: bool,
}

impl UdpChannel {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            closed: false,
        }
    }
}

impl Channel for UdpChannel {
    /// Non-blocking send. A full socket buffer surfaces as `WouldBlock`; the
    /// packet is simply lost and retransmission takes over.
    fn send_raw(&mut self, packet: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RelStreamError::ChannelClosed);
        }
        self.socket.try_send_to(packet, self.peer)?;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
