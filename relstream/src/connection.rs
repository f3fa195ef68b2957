//! Per-connection protocol engine.
//!
//! A `Connection` owns both directions of one reliable stream:
//!
//! ```text
//!   send_base            send_next
//!       │                    │
//!  ─────┼────────────────────┼─────────────▶ our sequence space
//!       │<─── in flight ────>│<── window ──>
//!
//!   recv_next
//!       │
//!  ─────┼─────────────────────────▶ peer's sequence space
//!       │<── receive window ──>│
//! ```
//!
//! Sequence numbers start at 1 and number whole segments, not bytes. The
//! engine never destroys itself; the scheduler inspects
//! [`Connection::is_terminated`] and reaps it.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};

use crate::config::Config;
use crate::error::RelStreamError;
use crate::packet::{Packet, MAX_PAYLOAD};
use crate::store::SegmentStore;
use crate::transport::{AppStream, Channel, ReadOutcome};

/// First sequence number used in each direction.
pub const INITIAL_SEQ: u32 = 1;

/// Where a connection stands in its teardown, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Neither side has finished sending.
    Active,
    /// Our EOF is out; the peer is still sending.
    LocalDone,
    /// The peer's EOF has arrived; we are still sending.
    RemoteDone,
    /// Both EOFs seen, waiting for acknowledgments or delivery.
    Draining,
    /// All four teardown conditions hold.
    Terminated,
    /// A fatal fault; the connection is waiting to be reaped.
    Aborted,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Active => write!(f, "Active"),
            Lifecycle::LocalDone => write!(f, "LocalDone"),
            Lifecycle::RemoteDone => write!(f, "RemoteDone"),
            Lifecycle::Draining => write!(f, "Draining"),
            Lifecycle::Terminated => write!(f, "Terminated"),
            Lifecycle::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Counters kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Packets handed to the channel, retransmissions included.
    pub packets_sent: u64,
    /// Of those, how many were retransmissions.
    pub retransmissions: u64,
    /// Packets that decoded cleanly.
    pub packets_received: u64,
    /// Datagrams discarded as corrupt.
    pub corrupt_dropped: u64,
    /// Segments discarded for lying beyond the receive window.
    pub out_of_window: u64,
    /// Segments already buffered or already delivered.
    pub duplicates: u64,
    /// Payload bytes taken from the application.
    pub bytes_sent: u64,
    /// Payload bytes handed to the application.
    pub bytes_delivered: u64,
}

/// One reliable connection.
pub struct Connection {
    window: u32,
    timeout: Duration,

    /// Oldest unacknowledged sequence number.
    send_base: u32,
    /// Next sequence number to assign.
    send_next: u32,
    /// Next sequence number to deliver to the application.
    recv_next: u32,

    /// Encoded packets awaiting acknowledgment, stamped with last send time.
    send_store: SegmentStore<Bytes>,
    /// Payloads at or above `recv_next` not yet handed to the application.
    recv_store: SegmentStore<Bytes>,

    local_eof_sent: bool,
    remote_eof_received: bool,
    eof_delivered: bool,
    aborted: bool,

    channel: Box<dyn Channel>,
    app: Box<dyn AppStream>,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection. Nothing is sent until the first
    /// [`on_readable`](Self::on_readable).
    pub fn new(config: &Config, channel: Box<dyn Channel>, app: Box<dyn AppStream>) -> Self {
        Self {
            window: config.window.max(1),
            timeout: config.timeout(),
            send_base: INITIAL_SEQ,
            send_next: INITIAL_SEQ,
            recv_next: INITIAL_SEQ,
            send_store: SegmentStore::new(),
            recv_store: SegmentStore::new(),
            local_eof_sent: false,
            remote_eof_received: false,
            eof_delivered: false,
            aborted: false,
            channel,
            app,
            stats: ConnectionStats::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one datagram from the channel.
    ///
    /// Corrupt datagrams are dropped with no other effect: no acknowledgment
    /// and no state change besides a counter.
    pub fn receive_raw(&mut self, datagram: &[u8], now: Instant) {
        if self.aborted {
            return;
        }
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                self.stats.corrupt_dropped += 1;
                tracing::debug!(error = %err, len = datagram.len(), "discarding corrupt packet");
                return;
            }
        };
        self.stats.packets_received += 1;
        match packet {
            Packet::Ack { ackno } => self.on_ack(ackno, now),
            Packet::Data { seqno, payload, .. } => self.on_segment(seqno, payload, now),
        }
    }

    /// Handle a cumulative acknowledgment: everything below `ackno` arrived.
    pub fn on_ack(&mut self, ackno: u32, now: Instant) {
        if self.aborted {
            return;
        }
        if ackno > self.send_next {
            tracing::debug!(
                ackno,
                send_next = self.send_next,
                "ignoring ack for a segment never sent"
            );
            return;
        }
        if ackno > self.send_base {
            self.send_base = ackno;
        }
        let acked = self.send_store.remove_below(ackno);
        if acked > 0 {
            tracing::trace!(
                ackno,
                acked,
                in_flight = self.send_store.len(),
                "acknowledged"
            );
        }
        // The window may have opened.
        self.on_readable(now);
    }

    /// Handle a data segment (or the EOF marker when `payload` is empty).
    pub fn on_segment(&mut self, seqno: u32, payload: Bytes, now: Instant) {
        if self.aborted {
            return;
        }
        let window_end = self.recv_next as u64 + self.window as u64;
        if seqno as u64 >= window_end {
            self.stats.out_of_window += 1;
            tracing::trace!(seqno, recv_next = self.recv_next, "segment beyond receive window");
            return;
        }
        if seqno < self.recv_next {
            // Already delivered. Our ack was probably lost, so repeat it.
            self.stats.duplicates += 1;
            self.send_ack();
            return;
        }
        if payload.is_empty() && !self.remote_eof_received {
            self.remote_eof_received = true;
            tracing::debug!(seqno, "peer finished sending");
        }
        if !self.recv_store.insert(seqno, payload, now) {
            self.stats.duplicates += 1;
            return;
        }
        self.deliver();
    }

    // -----------------------------------------------------------------------
    // Application side
    // -----------------------------------------------------------------------

    /// Pull data from the application while the send window has room.
    pub fn on_readable(&mut self, now: Instant) {
        if self.local_eof_sent || self.aborted {
            return;
        }
        while self.send_next - self.send_base < self.window {
            match self.app.read(MAX_PAYLOAD) {
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Data(chunk) if chunk.is_empty() => break,
                ReadOutcome::Data(chunk) => {
                    if !self.send_segment(chunk, now) {
                        break;
                    }
                }
                ReadOutcome::Exhausted => {
                    let seqno = self.send_next;
                    if self.send_segment(Bytes::new(), now) {
                        self.local_eof_sent = true;
                        tracing::debug!(seqno, "local input exhausted, EOF sent");
                    }
                    break;
                }
            }
        }
    }

    /// Retry delivery after the application freed sink space.
    pub fn on_writable(&mut self) {
        if !self.aborted {
            self.deliver();
        }
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    /// Re-send, byte for byte, every stored segment whose last transmission
    /// is at least one timeout old. Returns how many went out.
    pub fn retransmit_expired(&mut self, now: Instant) -> usize {
        if self.aborted {
            return 0;
        }
        let mut resent = 0;
        for (seqno, entry) in self.send_store.iter_mut() {
            if now.saturating_duration_since(entry.stamp) < self.timeout {
                continue;
            }
            entry.stamp = now;
            resent += 1;
            self.stats.packets_sent += 1;
            self.stats.retransmissions += 1;
            tracing::trace!(seqno, "retransmitting");
            if let Err(err) = self.channel.send_raw(&entry.value) {
                tracing::warn!(seqno, error = %err, "channel send failed");
            }
        }
        resent
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// All our segments, EOF included, have been acknowledged.
    pub fn send_buffer_empty(&self) -> bool {
        self.send_store.is_empty()
    }

    /// Everything received in order has reached the application.
    pub fn receive_buffer_drained(&self) -> bool {
        self.recv_store.is_empty()
    }

    /// The four-way conjunction under which the connection may be destroyed.
    pub fn is_terminated(&self) -> bool {
        self.local_eof_sent
            && self.remote_eof_received
            && self.send_buffer_empty()
            && self.receive_buffer_drained()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether the scheduler should destroy this connection.
    pub fn should_reap(&self) -> bool {
        self.aborted || self.is_terminated()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.aborted {
            return Lifecycle::Aborted;
        }
        if self.is_terminated() {
            return Lifecycle::Terminated;
        }
        match (self.local_eof_sent, self.remote_eof_received) {
            (false, false) => Lifecycle::Active,
            (true, false) => Lifecycle::LocalDone,
            (false, true) => Lifecycle::RemoteDone,
            (true, true) => Lifecycle::Draining,
        }
    }

    /// Release the channel and drop all buffered segments.
    pub fn shutdown(mut self) {
        if !self.eof_delivered {
            self.app.finish();
        }
        self.channel.close();
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn send_base(&self) -> u32 {
        self.send_base
    }

    pub fn send_next(&self) -> u32 {
        self.send_next
    }

    pub fn recv_next(&self) -> u32 {
        self.recv_next
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Segments sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.send_store.len()
    }

    /// Segments received but not yet delivered.
    pub fn buffered(&self) -> usize {
        self.recv_store.len()
    }

    pub fn local_eof_sent(&self) -> bool {
        self.local_eof_sent
    }

    pub fn remote_eof_received(&self) -> bool {
        self.remote_eof_received
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Hand in-order payloads to the application while it has room.
    fn deliver(&mut self) {
        while self.app.available_space() > 0 {
            let Some((seqno, entry)) = self.recv_store.first_mut() else {
                break;
            };
            if seqno != self.recv_next {
                break;
            }

            if entry.value.is_empty() {
                if !self.eof_delivered {
                    self.eof_delivered = true;
                    self.app.finish();
                }
            } else {
                let written = match self.app.write(&entry.value) {
                    Ok(n) => n.min(entry.value.len()),
                    Err(err) => {
                        self.abort(&err);
                        return;
                    }
                };
                self.stats.bytes_delivered += written as u64;
                if written < entry.value.len() {
                    // Keep the unwritten tail at the head of the stream.
                    entry.value.advance(written);
                    break;
                }
            }

            self.recv_store.remove(seqno);
            self.recv_next = match self.recv_next.checked_add(1) {
                Some(next) => next,
                None => {
                    self.abort(&RelStreamError::SequenceExhausted);
                    return;
                }
            };
            self.send_ack();
        }
    }

    /// Number, store and transmit one segment. Returns `false` if the
    /// connection had to be aborted instead.
    fn send_segment(&mut self, payload: Bytes, now: Instant) -> bool {
        let seqno = self.send_next;
        let Some(next) = seqno.checked_add(1) else {
            self.abort(&RelStreamError::SequenceExhausted);
            return false;
        };
        let payload_len = payload.len();
        let packet = match Packet::data(self.recv_next, seqno, payload) {
            Ok(packet) => packet,
            Err(err) => {
                self.abort(&err);
                return false;
            }
        };

        let encoded = packet.encode();
        self.send_store.insert(seqno, encoded.clone(), now);
        self.send_next = next;
        self.stats.bytes_sent += payload_len as u64;
        tracing::trace!(seqno, len = payload_len, "sending segment");
        self.transmit(&encoded);
        true
    }

    fn send_ack(&mut self) {
        let packet = Packet::ack(self.recv_next).encode();
        self.transmit(&packet);
    }

    fn transmit(&mut self, packet: &[u8]) {
        self.stats.packets_sent += 1;
        if let Err(err) = self.channel.send_raw(packet) {
            tracing::warn!(error = %err, "channel send failed");
        }
    }

    fn abort(&mut self, err: &RelStreamError) {
        if !self.aborted {
            tracing::warn!(error = %err, "connection aborted");
            self.aborted = true;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("lifecycle", &self.lifecycle())
            .field("send_base", &self.send_base)
            .field("send_next", &self.send_next)
            .field("recv_next", &self.recv_next)
            .field("in_flight", &self.send_store.len())
            .field("buffered", &self.recv_store.len())
            .finish()
    }
}
