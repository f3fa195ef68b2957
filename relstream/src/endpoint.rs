//! UDP endpoint: one socket, many connections, one event loop.
//!
//! The loop multiplexes three event sources with `tokio::select!`:
//! inbound datagrams are routed to the connection for their source
//! address, application readiness triggers a pump of every connection, and
//! the scheduler tick drives retransmission and teardown.
//!
//! A peer whose connection terminated cleanly lingers for a few
//! retransmission timeouts: any segment it repeats is answered with the
//! final cumulative ack and never reaches the acceptor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::connection::{Connection, Lifecycle, INITIAL_SEQ};
use crate::error::Result;
use crate::packet::{Packet, MAX_PACKET_LEN};
use crate::registry::{ConnectionId, Registry};
use crate::scheduler::{Reaped, Scheduler};
use crate::transport::udp::UdpChannel;
use crate::transport::AppStream;

/// Supplies the application stream for a peer that is not yet connected.
/// Returning `None` ignores the peer.
pub type Acceptor = Box<dyn FnMut(SocketAddr) -> Option<Box<dyn AppStream>> + Send>;

/// Retransmission timeouts a cleanly closed peer is remembered for.
const LINGER_TIMEOUTS: u32 = 3;

/// A closed peer that may still be retransmitting.
#[derive(Debug, Clone, Copy)]
struct Lingering {
    ackno: u32,
    until: Instant,
}

pub struct Endpoint {
    socket: Arc<UdpSocket>,
    config: Config,
    registry: Registry,
    scheduler: Scheduler,
    routes: HashMap<SocketAddr, ConnectionId>,
    lingering: HashMap<SocketAddr, Lingering>,
    readiness: Arc<Notify>,
    acceptor: Option<Acceptor>,
    accept_one: Option<Box<dyn AppStream>>,
}

impl Endpoint {
    /// Bind a UDP socket and prepare an empty endpoint.
    pub async fn bind(addr: impl ToSocketAddrs, config: Config) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(
            local = %socket.local_addr()?,
            window = config.window,
            timeout_ms = config.timeout_ms,
            "endpoint bound"
        );
        Ok(Self {
            socket: Arc::new(socket),
            scheduler: Scheduler::from_config(&config),
            config,
            registry: Registry::new(),
            routes: HashMap::new(),
            lingering: HashMap::new(),
            readiness: Arc::new(Notify::new()),
            acceptor: None,
            accept_one: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Signal to hand to application streams; notifying it makes the loop
    /// pull pending input and push pending output for every connection.
    pub fn readiness(&self) -> Arc<Notify> {
        self.readiness.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Open a connection to `peer`. Nothing is sent until [`run`](Self::run).
    pub fn connect(&mut self, peer: SocketAddr, stream: Box<dyn AppStream>) -> ConnectionId {
        self.open(peer, stream)
    }

    /// Accept connections from any unknown peer whose first packet is a
    /// clean opening segment.
    pub fn accept_with(
        &mut self,
        acceptor: impl FnMut(SocketAddr) -> Option<Box<dyn AppStream>> + Send + 'static,
    ) {
        self.acceptor = Some(Box::new(acceptor));
    }

    /// Accept exactly one connection, from whichever peer speaks first.
    pub fn accept_one(&mut self, stream: Box<dyn AppStream>) {
        self.accept_one = Some(stream);
    }

    /// Drive every connection until none is left, no more can be accepted
    /// and no closed peer is still lingering.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.scheduler.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // One spare byte so an oversized datagram reads as a length mismatch
        // instead of being silently truncated to a valid size.
        let mut buf = vec![0u8; MAX_PACKET_LEN + 1];

        self.socket.writable().await?;
        self.pump(Instant::now());

        while !self.is_finished() {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.dispatch(&buf[..n], from, Instant::now()),
                    Err(err) => tracing::warn!(error = %err, "socket receive failed"),
                },
                _ = self.readiness.notified() => self.pump(Instant::now()),
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let report = self.scheduler.tick(&mut self.registry, now);
                    for reaped in &report.reaped {
                        self.retire(reaped, now);
                    }
                    self.lingering.retain(|_, peer| peer.until > now);
                    self.pump(now);
                }
            }
        }

        tracing::info!("endpoint idle, stopping");
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.registry.is_empty()
            && self.lingering.is_empty()
            && self.acceptor.is_none()
            && self.accept_one.is_none()
    }

    /// Drop the route of a destroyed connection. A clean close leaves the
    /// peer lingering so its late retransmissions can still be acked.
    fn retire(&mut self, reaped: &Reaped, now: Instant) {
        let Some(peer) = self
            .routes
            .iter()
            .find(|(_, id)| **id == reaped.id)
            .map(|(peer, _)| *peer)
        else {
            return;
        };
        self.routes.remove(&peer);
        if reaped.lifecycle == Lifecycle::Terminated {
            self.lingering.insert(
                peer,
                Lingering {
                    ackno: reaped.recv_next,
                    until: now + self.config.timeout() * LINGER_TIMEOUTS,
                },
            );
        }
        tracing::debug!(connection = %reaped.id, %peer, lifecycle = %reaped.lifecycle, "route removed");
    }

    fn open(&mut self, peer: SocketAddr, stream: Box<dyn AppStream>) -> ConnectionId {
        let channel = UdpChannel::new(self.socket.clone(), peer);
        let connection = Connection::new(&self.config, Box::new(channel), stream);
        let id = self.registry.insert(connection);
        self.routes.insert(peer, id);
        tracing::debug!(connection = %id, %peer, "route added");
        id
    }

    fn dispatch(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let id = match self.routes.get(&from) {
            Some(id) => *id,
            None => {
                if let Some(closed) = self.lingering.get(&from).copied() {
                    self.answer_closed_peer(datagram, from, closed);
                    return;
                }
                match self.admit_peer(datagram, from) {
                    Some(id) => id,
                    None => return,
                }
            }
        };
        if let Some(connection) = self.registry.get_mut(id) {
            connection.receive_raw(datagram, now);
            connection.on_readable(now);
        }
    }

    /// Repeat the final ack to a peer whose connection already closed.
    fn answer_closed_peer(&self, datagram: &[u8], from: SocketAddr, closed: Lingering) {
        if !matches!(Packet::decode(datagram), Ok(Packet::Data { .. })) {
            return;
        }
        tracing::debug!(peer = %from, ackno = closed.ackno, "re-acknowledging closed connection");
        if let Err(err) = self.socket.try_send_to(&Packet::ack(closed.ackno).encode(), from) {
            tracing::warn!(peer = %from, error = %err, "channel send failed");
        }
    }

    /// Create a connection for an unknown peer, but only on a clean segment
    /// that opens a stream.
    fn admit_peer(&mut self, datagram: &[u8], from: SocketAddr) -> Option<ConnectionId> {
        match Packet::decode(datagram) {
            Ok(Packet::Data { seqno, .. }) if seqno == INITIAL_SEQ => {}
            Ok(packet) => {
                tracing::debug!(peer = %from, ?packet, "ignoring mid-stream packet from unknown peer");
                return None;
            }
            Err(err) => {
                tracing::debug!(peer = %from, error = %err, "ignoring invalid datagram from unknown peer");
                return None;
            }
        }
        let stream = if let Some(stream) = self.accept_one.take() {
            stream
        } else if let Some(acceptor) = self.acceptor.as_mut() {
            match acceptor(from) {
                Some(stream) => stream,
                None => {
                    tracing::debug!(peer = %from, "peer refused");
                    return None;
                }
            }
        } else {
            tracing::debug!(peer = %from, "datagram from unknown peer");
            return None;
        };
        tracing::info!(peer = %from, "accepted peer");
        Some(self.open(from, stream))
    }

    fn pump(&mut self, now: Instant) {
        for (_, connection) in self.registry.iter_mut() {
            connection.on_writable();
            connection.on_readable(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::transport::memory::{MemoryStream, MemoryStreamHandle};

    /// Counts acceptor calls and keeps the application end of every
    /// accepted stream.
    #[derive(Clone, Default)]
    struct Accepted {
        calls: Arc<AtomicUsize>,
        apps: Arc<Mutex<Vec<MemoryStreamHandle>>>,
    }

    impl Accepted {
        fn install(&self, endpoint: &mut Endpoint, close_input: bool) {
            let accepted = self.clone();
            endpoint.accept_with(move |_peer| {
                accepted.calls.fetch_add(1, Ordering::SeqCst);
                let (stream, app) = MemoryStream::unbounded();
                if close_input {
                    app.close_input();
                }
                accepted.apps.lock().push(app);
                Some(Box::new(stream) as Box<dyn AppStream>)
            });
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    async fn raw_peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn send(socket: &UdpSocket, packet: &Packet, to: SocketAddr) {
        socket.send_to(&packet.encode(), to).await.unwrap();
    }

    async fn recv(socket: &UdpSocket, wait: Duration) -> Option<Packet> {
        let mut buf = [0u8; MAX_PACKET_LEN];
        match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => Some(Packet::decode(&buf[..n]).unwrap()),
            _ => None,
        }
    }

    fn segment(seqno: u32, payload: &'static [u8]) -> Packet {
        Packet::data(1, seqno, Bytes::from_static(payload)).unwrap()
    }

    #[tokio::test]
    async fn idle_endpoint_returns_immediately() {
        let endpoint = Endpoint::bind("127.0.0.1:0", Config::default()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), endpoint.run())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        assert!(Endpoint::bind("127.0.0.1:0", Config::new(0, 100)).await.is_err());
    }

    #[tokio::test]
    async fn memory_streams_over_loopback() {
        let config = Config::new(8, 200);
        let mut client = Endpoint::bind("127.0.0.1:0", config.clone()).await.unwrap();
        let mut server = Endpoint::bind("127.0.0.1:0", config).await.unwrap();

        let (client_stream, client_app) = MemoryStream::unbounded();
        client_app.push_input(b"hello from the client");
        client_app.close_input();
        let (server_stream, server_app) = MemoryStream::unbounded();
        server_app.push_input(b"and hello back");
        server_app.close_input();

        let server_addr = server.local_addr().unwrap();
        client.connect(server_addr, Box::new(client_stream));
        server.accept_one(Box::new(server_stream));
        assert_eq!(client.registry().len(), 1);

        let server = tokio::spawn(server.run());
        let client = tokio::spawn(client.run());
        tokio::time::timeout(Duration::from_secs(10), async {
            client.await.unwrap().unwrap();
            server.await.unwrap().unwrap();
        })
        .await
        .unwrap();

        assert_eq!(&server_app.take_output()[..], b"hello from the client");
        assert_eq!(&client_app.take_output()[..], b"and hello back");
        assert!(server_app.is_finished());
        assert!(client_app.is_finished());
    }

    #[tokio::test]
    async fn unknown_peer_needs_a_clean_opening_segment() {
        let mut server = Endpoint::bind("127.0.0.1:0", Config::new(4, 200)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let accepted = Accepted::default();
        accepted.install(&mut server, false);
        let _running = tokio::spawn(server.run());

        let peer = raw_peer().await;
        let mut corrupt = segment(1, b"hello").encode().to_vec();
        corrupt[13] ^= 0x01;
        peer.send_to(&[1, 2, 3], server_addr).await.unwrap();
        peer.send_to(&corrupt, server_addr).await.unwrap();
        send(&peer, &Packet::ack(1), server_addr).await;
        send(&peer, &segment(2, b"late"), server_addr).await;

        assert_eq!(recv(&peer, Duration::from_millis(300)).await, None);
        assert_eq!(accepted.calls(), 0);

        send(&peer, &segment(1, b"hello"), server_addr).await;
        assert_eq!(recv(&peer, Duration::from_secs(2)).await, Some(Packet::ack(2)));
        assert_eq!(accepted.calls(), 1);
        assert_eq!(&accepted.apps.lock()[0].take_output()[..], b"hello");
    }

    #[tokio::test]
    async fn refusing_acceptor_ignores_peer() {
        let mut server = Endpoint::bind("127.0.0.1:0", Config::new(4, 200)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        server.accept_with(move |_peer| {
            counted.fetch_add(1, Ordering::SeqCst);
            None
        });
        let _running = tokio::spawn(server.run());

        let peer = raw_peer().await;
        send(&peer, &segment(1, b"knock"), server_addr).await;
        send(&peer, &segment(1, b"knock"), server_addr).await;

        assert_eq!(recv(&peer, Duration::from_millis(300)).await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn acceptor_serves_distinct_peers() {
        let mut server = Endpoint::bind("127.0.0.1:0", Config::new(4, 200)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let accepted = Accepted::default();
        accepted.install(&mut server, false);
        let _running = tokio::spawn(server.run());

        let one = raw_peer().await;
        let two = raw_peer().await;
        send(&one, &segment(1, b"from one"), server_addr).await;
        assert_eq!(recv(&one, Duration::from_secs(2)).await, Some(Packet::ack(2)));
        send(&two, &segment(1, b"from two"), server_addr).await;
        assert_eq!(recv(&two, Duration::from_secs(2)).await, Some(Packet::ack(2)));

        assert_eq!(accepted.calls(), 2);
        let apps = accepted.apps.lock();
        assert_eq!(&apps[0].take_output()[..], b"from one");
        assert_eq!(&apps[1].take_output()[..], b"from two");
    }

    #[tokio::test]
    async fn repeated_eof_after_teardown_is_only_acked() {
        let mut server = Endpoint::bind("127.0.0.1:0", Config::new(4, 200)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let accepted = Accepted::default();
        accepted.install(&mut server, true);
        let _running = tokio::spawn(server.run());

        let peer = raw_peer().await;
        send(&peer, &segment(1, b"hi"), server_addr).await;
        send(&peer, &Packet::eof(1, 2), server_addr).await;

        // Collect until the server's own EOF shows up, then acknowledge it.
        let mut server_eof = false;
        while !server_eof {
            match recv(&peer, Duration::from_secs(2)).await {
                Some(Packet::Data { seqno: 1, payload, .. }) if payload.is_empty() => server_eof = true,
                Some(_) => {}
                None => panic!("server never sent its EOF"),
            }
        }
        send(&peer, &Packet::ack(2), server_addr).await;

        // Let the scheduler reap the connection, then repeat our EOF as if
        // the server's ack for it had been lost.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while recv(&peer, Duration::from_millis(10)).await.is_some() {}
        send(&peer, &Packet::eof(1, 2), server_addr).await;

        assert_eq!(recv(&peer, Duration::from_secs(2)).await, Some(Packet::ack(3)));
        while let Some(packet) = recv(&peer, Duration::from_millis(300)).await {
            assert_eq!(packet, Packet::ack(3), "closed peer must only be acked");
        }
        assert_eq!(accepted.calls(), 1);
        let apps = accepted.apps.lock();
        assert_eq!(&apps[0].take_output()[..], b"hi");
        assert!(apps[0].is_finished());
    }
}
