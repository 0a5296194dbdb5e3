//! Peer channel transport.
//!
//! Session establishment (offer/answer, ICE) happens elsewhere; by the time
//! this layer is used, a peer connection exists that can carry one negotiated
//! control channel and any number of labelled data channels. Every channel
//! delivers whole text or binary frames, in order, exactly once.
//!
//! `memory` provides an in-process connection pair with the same semantics,
//! including buffered-amount accounting for flow control.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;

/// Channel identifier, shared by both peers for the same channel.
pub type ChannelId = u16;

/// Fixed identifier of the negotiated control channel.
pub const CONTROL_CHANNEL_ID: ChannelId = 0;

/// Label of the negotiated control channel.
pub const CONTROL_CHANNEL_LABEL: &str = "ctrl";

/// One message on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes, as counted against the buffered amount.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {0} is not open")]
    NotOpen(ChannelId),
    #[error("channel {0} closed")]
    Closed(ChannelId),
    #[error("frame of {size} bytes exceeds the {max} byte message limit")]
    TooLarge { size: usize, max: usize },
}

/// A single ordered, reliable, message-oriented channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn label(&self) -> &str;
    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Resolves once the channel is open; errs if it closes first.
    async fn opened(&self) -> Result<(), ChannelError>;

    async fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    /// Next inbound frame, or `None` once the channel is closed and drained.
    async fn recv(&self) -> Option<Frame>;

    /// Resolves once the channel is closed.
    async fn closed(&self);

    fn close(&self);

    /// Bytes handed to `send` that the peer has not consumed yet.
    fn buffered_amount(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Resolves when the buffered amount is at or below the low threshold.
    async fn buffered_amount_low(&self) -> Result<(), ChannelError>;
}

pub type DynChannel = Arc<dyn DataChannel>;

/// An established connection to exactly one peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open (or join) the negotiated channel with a fixed id. Both peers call
    /// this; the channel is open once both sides have.
    async fn open_control_channel(&self, id: ChannelId) -> Result<DynChannel, ChannelError>;

    /// Open a new data channel; the peer sees it through `accept_channel`.
    async fn open_channel(&self, label: &str) -> Result<DynChannel, ChannelError>;

    /// Next data channel opened by the peer, or `None` once the connection is gone.
    async fn accept_channel(&self) -> Option<DynChannel>;

    /// Largest frame the transport carries in one message.
    fn max_message_size(&self) -> usize;
}

pub type DynConnection = Arc<dyn PeerConnection>;
