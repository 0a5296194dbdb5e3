//! In-process peer connection pair.
//!
//! Both endpoints share the channel state; a frame sent on one side is queued
//! for the other and counted in the sender's buffered amount until the
//! receiver takes it off the queue.

use crate::{
    ChannelError, ChannelId, ChannelState, DataChannel, DynChannel, Frame, PeerConnection,
    CONTROL_CHANNEL_LABEL,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};

/// SCTP's common default for a single message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One direction of a channel.
#[derive(Default)]
struct Pipe {
    queue: Mutex<VecDeque<Frame>>,
    buffered: AtomicUsize,
    peak: AtomicUsize,
    low_threshold: AtomicUsize,
    arrived: Notify,
    drained: Notify,
}

impl Pipe {
    /// The counters move under the queue lock so a frame is never visible
    /// to the receiver before it is counted.
    fn push(&self, frame: Frame) {
        let size = frame.len();
        {
            let mut queue = lock(&self.queue);
            let now = self.buffered.fetch_add(size, Ordering::SeqCst) + size;
            self.peak.fetch_max(now, Ordering::SeqCst);
            queue.push_back(frame);
        }
        self.arrived.notify_waiters();
    }

    fn pop(&self) -> Option<Frame> {
        let (frame, left) = {
            let mut queue = lock(&self.queue);
            let frame = queue.pop_front()?;
            let size = frame.len();
            let left = self.buffered.fetch_sub(size, Ordering::SeqCst) - size;
            (frame, left)
        };
        if left <= self.low_threshold.load(Ordering::SeqCst) {
            self.drained.notify_waiters();
        }
        Some(frame)
    }
}

struct Link {
    id: ChannelId,
    label: String,
    max_message_size: usize,
    state: watch::Sender<ChannelState>,
    pipes: [Pipe; 2],
}

impl Link {
    fn new(id: ChannelId, label: &str, max_message_size: usize, state: ChannelState) -> Arc<Self> {
        let (state, _) = watch::channel(state);
        Arc::new(Self {
            id,
            label: label.to_string(),
            max_message_size,
            state,
            pipes: [Pipe::default(), Pipe::default()],
        })
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_open(&self) {
        self.state.send_if_modified(|s| {
            if *s == ChannelState::Connecting {
                *s = ChannelState::Open;
                true
            } else {
                false
            }
        });
    }

    fn close(&self) {
        let changed = self.state.send_if_modified(|s| {
            if *s != ChannelState::Closed {
                *s = ChannelState::Closed;
                true
            } else {
                false
            }
        });
        if changed {
            for pipe in &self.pipes {
                pipe.arrived.notify_waiters();
                pipe.drained.notify_waiters();
            }
            tracing::trace!(channel = self.id, label = %self.label, "channel closed");
        }
    }
}

/// One endpoint of an in-memory channel.
pub struct MemoryChannel {
    link: Arc<Link>,
    side: usize,
}

impl MemoryChannel {
    /// A standalone open channel pair, outside any connection.
    pub fn pair(id: ChannelId, label: &str, max_message_size: usize) -> (Self, Self) {
        Self::ends(Link::new(id, label, max_message_size, ChannelState::Open))
    }

    fn ends(link: Arc<Link>) -> (Self, Self) {
        (
            Self {
                link: link.clone(),
                side: 0,
            },
            Self { link, side: 1 },
        )
    }

    fn outbound(&self) -> &Pipe {
        &self.link.pipes[self.side]
    }

    fn inbound(&self) -> &Pipe {
        &self.link.pipes[1 - self.side]
    }

    /// Highest buffered amount this endpoint has had outstanding.
    pub fn peak_buffered_amount(&self) -> usize {
        self.outbound().peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.link.id
    }

    fn label(&self) -> &str {
        &self.link.label
    }

    fn state(&self) -> ChannelState {
        self.link.state()
    }

    async fn opened(&self) -> Result<(), ChannelError> {
        let mut rx = self.link.state.subscribe();
        let state = rx
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map(|s| *s)
            .unwrap_or(ChannelState::Closed);
        match state {
            ChannelState::Open => Ok(()),
            _ => Err(ChannelError::Closed(self.link.id)),
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.link.state() != ChannelState::Open {
            return Err(ChannelError::NotOpen(self.link.id));
        }
        let size = frame.len();
        if size > self.link.max_message_size {
            return Err(ChannelError::TooLarge {
                size,
                max: self.link.max_message_size,
            });
        }
        self.outbound().push(frame);
        Ok(())
    }

    async fn recv(&self) -> Option<Frame> {
        let pipe = self.inbound();
        loop {
            let notified = pipe.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(frame) = pipe.pop() {
                return Some(frame);
            }
            if self.link.state() == ChannelState::Closed {
                return None;
            }
            notified.await;
        }
    }

    async fn closed(&self) {
        let mut rx = self.link.state.subscribe();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }

    fn close(&self) {
        self.link.close();
    }

    fn buffered_amount(&self) -> usize {
        self.outbound().buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.outbound()
            .low_threshold
            .store(threshold, Ordering::SeqCst);
    }

    async fn buffered_amount_low(&self) -> Result<(), ChannelError> {
        let pipe = self.outbound();
        loop {
            let notified = pipe.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if pipe.buffered.load(Ordering::SeqCst) <= pipe.low_threshold.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.link.state() == ChannelState::Closed {
                return Err(ChannelError::Closed(self.link.id));
            }
            notified.await;
        }
    }
}

struct Negotiation {
    creator: usize,
    peer_end: MemoryChannel,
}

struct Shared {
    next_id: AtomicU16,
    negotiated: Mutex<HashMap<ChannelId, Negotiation>>,
    max_message_size: usize,
}

/// One side of an in-process peer connection.
pub struct MemoryConnection {
    side: usize,
    shared: Arc<Shared>,
    to_peer: mpsc::UnboundedSender<DynChannel>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DynChannel>>,
}

impl MemoryConnection {
    /// Two connected endpoints. Index 0 is conventionally the offerer.
    pub fn pair(max_message_size: usize) -> (Self, Self) {
        let shared = Arc::new(Shared {
            next_id: AtomicU16::new(1),
            negotiated: Mutex::new(HashMap::new()),
            max_message_size,
        });
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Self {
            side: 0,
            shared: shared.clone(),
            to_peer: tx_b,
            incoming: tokio::sync::Mutex::new(rx_a),
        };
        let b = Self {
            side: 1,
            shared,
            to_peer: tx_a,
            incoming: tokio::sync::Mutex::new(rx_b),
        };
        (a, b)
    }

    fn split(&self, link: Arc<Link>) -> (MemoryChannel, MemoryChannel) {
        let (zero, one) = MemoryChannel::ends(link);
        if self.side == 0 {
            (zero, one)
        } else {
            (one, zero)
        }
    }

    fn allocate_id(&self) -> ChannelId {
        loop {
            let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
            if id != crate::CONTROL_CHANNEL_ID {
                return id;
            }
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn open_control_channel(&self, id: ChannelId) -> Result<DynChannel, ChannelError> {
        let mut negotiated = lock(&self.shared.negotiated);
        if let Some(pending) = negotiated.remove(&id) {
            if pending.creator != self.side && pending.peer_end.state() != ChannelState::Closed {
                pending.peer_end.link.set_open();
                tracing::debug!(channel = id, "negotiated channel open");
                return Ok(Arc::new(pending.peer_end));
            }
            // Our own earlier attempt, superseded.
            pending.peer_end.link.close();
        }
        let link = Link::new(
            id,
            CONTROL_CHANNEL_LABEL,
            self.shared.max_message_size,
            ChannelState::Connecting,
        );
        let (own, peer_end) = self.split(link);
        negotiated.insert(
            id,
            Negotiation {
                creator: self.side,
                peer_end,
            },
        );
        Ok(Arc::new(own))
    }

    async fn open_channel(&self, label: &str) -> Result<DynChannel, ChannelError> {
        let id = self.allocate_id();
        let link = Link::new(id, label, self.shared.max_message_size, ChannelState::Open);
        let (own, peer_end) = self.split(link);
        self.to_peer
            .send(Arc::new(peer_end))
            .map_err(|_| ChannelError::Closed(id))?;
        tracing::trace!(channel = id, label, "data channel opened");
        Ok(Arc::new(own))
    }

    async fn accept_channel(&self) -> Option<DynChannel> {
        self.incoming.lock().await.recv().await
    }

    fn max_message_size(&self) -> usize {
        self.shared.max_message_size
    }
}
