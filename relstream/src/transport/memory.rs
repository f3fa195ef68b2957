//! In-memory channel and application stream, plus a lossy link model.
//!
//! Datagrams travel through `crossbeam_queue::SegQueue`s; whoever drives the
//! simulation drains one side's queue through a [`LossyLink`] and feeds the
//! survivors to the other side's connection.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::error::{RelStreamError, Result};
use crate::transport::{AppStream, Channel, ReadOutcome};

/// Shared queue of encoded datagrams.
pub type Datagrams = Arc<SegQueue<Bytes>>;

/// A channel whose sends land on a shared queue.
pub struct MemoryChannel {
    outbox: Datagrams,
    closed: bool,
}

impl MemoryChannel {
    pub fn new(outbox: Datagrams) -> Self {
        Self {
            outbox,
            closed: false,
        }
    }

    /// Create a channel together with the queue it sends into.
    pub fn with_queue() -> (Self, Datagrams) {
        let queue: Datagrams = Arc::new(SegQueue::new());
        (Self::new(queue.clone()), queue)
    }
}

impl Channel for MemoryChannel {
    fn send_raw(&mut self, packet: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RelStreamError::ChannelClosed);
        }
        self.outbox.push(Bytes::copy_from_slice(packet));
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Default)]
struct StreamState {
    input: BytesMut,
    input_closed: bool,
    output: BytesMut,
    capacity: usize,
    finished: bool,
    fail_writes: bool,
}

/// Application stream backed by in-memory buffers.
///
/// The sink holds at most `capacity` undelivered bytes; the test or
/// simulation frees space by draining it through the handle.
pub struct MemoryStream {
    state: Arc<Mutex<StreamState>>,
}

/// The application's end of a [`MemoryStream`].
#[derive(Clone)]
pub struct MemoryStreamHandle {
    state: Arc<Mutex<StreamState>>,
}

impl MemoryStream {
    /// Create a stream whose sink holds up to `capacity` bytes.
    pub fn new(capacity: usize) -> (Self, MemoryStreamHandle) {
        let state = Arc::new(Mutex::new(StreamState {
            capacity,
            ..StreamState::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            MemoryStreamHandle { state },
        )
    }

    /// Create a stream whose sink never fills up.
    pub fn unbounded() -> (Self, MemoryStreamHandle) {
        Self::new(usize::MAX)
    }
}

impl AppStream for MemoryStream {
    fn read(&mut self, max: usize) -> ReadOutcome {
        let mut state = self.state.lock();
        if !state.input.is_empty() {
            let n = max.min(state.input.len());
            ReadOutcome::Data(state.input.split_to(n).freeze())
        } else if state.input_closed {
            ReadOutcome::Exhausted
        } else {
            ReadOutcome::WouldBlock
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(RelStreamError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sink rejected write",
            )));
        }
        let room = state.capacity.saturating_sub(state.output.len());
        let n = data.len().min(room);
        state.output.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn finish(&mut self) {
        self.state.lock().finished = true;
    }

    fn available_space(&self) -> usize {
        let state = self.state.lock();
        state.capacity.saturating_sub(state.output.len())
    }
}

impl MemoryStreamHandle {
    /// Queue bytes for the connection to send.
    pub fn push_input(&self, data: &[u8]) {
        self.state.lock().input.extend_from_slice(data);
    }

    /// Mark the input as complete; once drained the stream reports exhaustion.
    pub fn close_input(&self) {
        self.state.lock().input_closed = true;
    }

    /// Take everything delivered so far, freeing sink space.
    pub fn take_output(&self) -> Bytes {
        self.state.lock().output.split().freeze()
    }

    /// Number of delivered bytes not yet taken.
    pub fn output_len(&self) -> usize {
        self.state.lock().output.len()
    }

    /// Whether the connection signalled end of the peer's stream.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }

    /// Make every subsequent sink write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }
}

/// Fault probabilities applied by a [`LossyLink`], each in `0.0..=1.0`.
#[derive(Debug, Clone, Default)]
pub struct LinkModel {
    /// Probability that a datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a datagram is held back one round, letting later
    /// datagrams overtake it.
    pub reorder_rate: f64,
    /// Probability that one random bit of a datagram is flipped.
    pub corrupt_rate: f64,
}

type DropFilter = Box<dyn FnMut(&Bytes) -> bool + Send>;

/// Carries datagrams off a queue, applying a [`LinkModel`].
///
/// Faults are drawn from a `StdRng`; two links built with the same model
/// and seed treat the same traffic identically.
pub struct LossyLink {
    model: LinkModel,
    rng: StdRng,
    held: Vec<Bytes>,
    drop_filter: Option<DropFilter>,
}

impl LossyLink {
    /// A link seeded from the operating system.
    pub fn new(model: LinkModel) -> Self {
        Self::seeded(model, rand::random())
    }

    /// A link whose fault sequence is fixed by `seed`.
    pub fn seeded(model: LinkModel, seed: u64) -> Self {
        Self {
            model,
            rng: StdRng::seed_from_u64(seed),
            held: Vec::new(),
            drop_filter: None,
        }
    }

    /// A link that delivers everything, in order, exactly once.
    pub fn perfect() -> Self {
        Self::new(LinkModel::default())
    }

    /// Drop every datagram for which `filter` returns `true`, before the
    /// random faults are applied.
    pub fn drop_when(mut self, filter: impl FnMut(&Bytes) -> bool + Send + 'static) -> Self {
        self.drop_filter = Some(Box::new(filter));
        self
    }

    /// Drain `queue` and return the datagrams that make it across, in
    /// arrival order. Datagrams held back last round arrive after this
    /// round's.
    pub fn carry(&mut self, queue: &SegQueue<Bytes>) -> Vec<Bytes> {
        let held = std::mem::take(&mut self.held);
        let mut delivered = Vec::new();

        while let Some(datagram) = queue.pop() {
            if let Some(filter) = self.drop_filter.as_mut() {
                if filter(&datagram) {
                    continue;
                }
            }
            if self.chance(self.model.loss_rate) {
                continue;
            }
            let datagram = if self.chance(self.model.corrupt_rate) {
                self.flip_random_bit(&datagram)
            } else {
                datagram
            };
            if self.chance(self.model.reorder_rate) {
                self.held.push(datagram);
                continue;
            }
            if self.chance(self.model.duplicate_rate) {
                delivered.push(datagram.clone());
            }
            delivered.push(datagram);
        }

        delivered.extend(held);
        delivered
    }

    /// Datagrams currently held back for reordering.
    pub fn in_transit(&self) -> usize {
        self.held.len()
    }

    fn chance(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.random::<f64>() < p
    }

    fn flip_random_bit(&mut self, datagram: &Bytes) -> Bytes {
        if datagram.is_empty() {
            return datagram.clone();
        }
        let mut bytes = BytesMut::from(&datagram[..]);
        let bit = self.rng.random_range(0..bytes.len() * 8);
        bytes[bit / 8] ^= 1 << (bit % 8);
        bytes.freeze()
    }
}
