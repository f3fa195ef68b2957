//! Collaborator seams: the datagram channel beneath a connection and the
//! application byte stream above it.

pub mod memory;
pub mod pipe;
pub mod udp;

use bytes::Bytes;

use crate::error::Result;

/// Outcome of pulling bytes from the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Between 1 and the requested number of bytes.
    Data(Bytes),
    /// Nothing available right now; more may arrive later.
    WouldBlock,
    /// The application will never supply more bytes.
    Exhausted,
}

/// Trait for the unreliable datagram channel under a connection.
///
/// Sends are fire-and-forget: an error is reported to the caller for
/// logging, and retransmission covers whatever was lost.
pub trait Channel: Send {
    /// Hand one encoded packet to the network.
    fn send_raw(&mut self, packet: &[u8]) -> Result<()>;
    /// Release the channel. Later sends fail with `ChannelClosed`.
    fn close(&mut self);
}

/// Trait for the application side of a connection.
///
/// None of these calls may block.
pub trait AppStream: Send {
    /// Pull up to `max` bytes of outbound data.
    fn read(&mut self, max: usize) -> ReadOutcome;
    /// Offer inbound data to the sink. Returns how many bytes were taken,
    /// which may be fewer than offered. An error is fatal for the connection.
    fn write(&mut self, data: &[u8]) -> Result<usize>;
    /// Tell the sink that the peer's stream has ended.
    fn finish(&mut self);
    /// Bytes the sink can take right now; zero means try again later.
    fn available_space(&self) -> usize;
}
