//! Chunked byte transfer over dedicated data channels.
//!
//! Every transfer owns one channel. The sender writes a `meta` header with the
//! total size, then binary chunks, pausing whenever the channel's buffered
//! amount reaches the high watermark until it drains to the low one. The
//! receiver closes the channel once it holds `size` bytes; the sender releases
//! its handle when it sees the close.

use crate::command::{Command, CommandEnvelope, RemoteFailure, Role, TransferHeader};
use crate::config::SessionConfig;
use crate::error::ShareError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use transport::{ChannelId, DynChannel, DynConnection, Frame};

/// Label of channels carrying a single file.
pub const FILE_CHANNEL_LABEL: &str = "file";

/// Label of channels carrying an episode abstract.
pub const ABSTRACT_CHANNEL_LABEL: &str = "file_abstract";

const MIN_HIGH_WATERMARK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub chunk_size: usize,
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub fn for_chunk_size(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            low: chunk_size,
            high: chunk_size.saturating_mul(8).max(MIN_HIGH_WATERMARK),
        }
    }
}

/// Where a transfer request sends its triggering command.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, envelope: CommandEnvelope) -> Result<(), ShareError>;
}

/// Run `fut` under an optional time limit.
pub(crate) async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T, ShareError>
where
    F: Future<Output = Result<T, ShareError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(ShareError::Timeout)),
        None => fut.await,
    }
}

pub fn split_chunks(bytes: &[u8], chunk_size: usize) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(chunk_size.max(1))
}

/// Receive-side state of one transfer.
#[derive(Debug, Default)]
pub struct TransferSession {
    expected_size: Option<u64>,
    chunks: Vec<Vec<u8>>,
    received_bytes: u64,
    failure: Option<RemoteFailure>,
}

impl TransferSession {
    /// Take one frame; true once the transfer needs nothing more.
    pub fn accept(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Text(text) => match serde_json::from_str::<TransferHeader>(&text) {
                Ok(TransferHeader::Meta { size }) => self.expected_size = Some(size),
                Ok(TransferHeader::Error { reason }) => self.failure = Some(reason),
                Err(e) => debug!("ignoring unknown transfer frame: {e}"),
            },
            Frame::Binary(chunk) => {
                self.received_bytes += chunk.len() as u64;
                self.chunks.push(chunk);
            }
        }
        self.is_complete() || self.failure.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.expected_size == Some(self.received_bytes)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Result of the transfer once the channel has closed.
    pub fn finish(self) -> Result<Vec<u8>, ShareError> {
        if let Some(failure) = self.failure {
            return Err(failure.into());
        }
        if !self.is_complete() {
            return Err(ShareError::IncompleteTransfer {
                expected: self.expected_size,
                received: self.received_bytes,
            });
        }
        Ok(self.chunks.concat())
    }
}

pub struct TransferEngine {
    connection: DynConnection,
    channels: Arc<Mutex<HashMap<ChannelId, DynChannel>>>,
    marks: Watermarks,
    timeout: Option<Duration>,
}

impl TransferEngine {
    pub fn new(connection: DynConnection, config: &SessionConfig) -> Self {
        let limit = connection.max_message_size();
        let chunk_size = config.chunk_size.map_or(limit, |c| c.min(limit));
        Self {
            connection,
            channels: Arc::new(Mutex::new(HashMap::new())),
            marks: Watermarks::for_chunk_size(chunk_size),
            timeout: config.request_timeout(),
        }
    }

    pub fn watermarks(&self) -> Watermarks {
        self.marks
    }

    /// Keep a channel the peer opened until a command names it or it closes.
    pub async fn register(&self, channel: DynChannel) {
        let id = channel.id();
        trace!(channel = id, label = channel.label(), "data channel registered");
        self.channels.lock().await.insert(id, channel.clone());

        let channels = self.channels.clone();
        tokio::spawn(async move {
            channel.closed().await;
            let mut channels = channels.lock().await;
            if channels
                .get(&id)
                .is_some_and(|current| Arc::ptr_eq(current, &channel))
            {
                channels.remove(&id);
                trace!(channel = id, "closed data channel dropped");
            }
        });
    }

    /// Channels registered and not yet released.
    pub async fn open_channels(&self) -> usize {
        self.channels.lock().await.len()
    }

    async fn channel(&self, id: ChannelId) -> Result<DynChannel, ShareError> {
        match self.channels.lock().await.get(&id) {
            Some(channel) if channel.is_open() => Ok(channel.clone()),
            _ => Err(ShareError::ChannelNotReady { channel: id }),
        }
    }

    /// Drop a channel whose request could not be served.
    pub async fn abandon(&self, id: ChannelId) {
        if let Some(channel) = self.channels.lock().await.remove(&id) {
            debug!(channel = id, "data channel abandoned");
            channel.close();
        }
    }

    async fn release(&self, id: ChannelId) {
        if self.channels.lock().await.remove(&id).is_some() {
            trace!(channel = id, "data channel released");
        }
    }

    /// Send `bytes` on a registered channel and wait for the receiver to close it.
    pub async fn transmit(&self, bytes: &[u8], channel_id: ChannelId) -> Result<(), ShareError> {
        let channel = self.channel(channel_id).await?;

        let result = self.send_chunks(&channel, bytes).await;
        match &result {
            Ok(()) => {
                let closed = async {
                    channel.closed().await;
                    Ok::<(), ShareError>(())
                };
                if bounded(self.timeout, closed).await.is_err() {
                    warn!(channel = channel_id, "receiver never closed the channel");
                    channel.close();
                }
            }
            Err(_) => channel.close(),
        }
        self.release(channel_id).await;
        result
    }

    async fn send_chunks(&self, channel: &DynChannel, bytes: &[u8]) -> Result<(), ShareError> {
        let marks = self.marks;
        channel.set_buffered_amount_low_threshold(marks.low);

        let header = TransferHeader::Meta {
            size: bytes.len() as u64,
        };
        channel.send(Frame::Text(serde_json::to_string(&header)?)).await?;

        for chunk in split_chunks(bytes, marks.chunk_size) {
            if channel.buffered_amount() >= marks.high {
                trace!(
                    channel = channel.id(),
                    buffered = channel.buffered_amount(),
                    "pausing until the channel drains"
                );
                channel.buffered_amount_low().await?;
            }
            channel.send(Frame::Binary(chunk.to_vec())).await?;
        }

        debug!(channel = channel.id(), bytes = bytes.len(), "transfer sent");
        Ok(())
    }

    /// Report a failed request on its channel instead of data.
    pub async fn transmit_failure(
        &self,
        channel_id: ChannelId,
        failure: RemoteFailure,
    ) -> Result<(), ShareError> {
        let channel = self.channel(channel_id).await?;
        self.release(channel_id).await;

        let header = TransferHeader::Error { reason: failure };
        let sent = channel.send(Frame::Text(serde_json::to_string(&header)?)).await;
        channel.close();
        sent.map_err(ShareError::from)
    }

    /// Open a channel, ask the Host to fill it, and collect what arrives.
    ///
    /// `args` gains a `channel` field naming the new channel.
    pub async fn request(
        &self,
        sink: &dyn CommandSink,
        label: &str,
        cmd: Command,
        mut args: Map<String, Value>,
    ) -> Result<Vec<u8>, ShareError> {
        let channel = self.connection.open_channel(label).await?;
        let id = channel.id();
        args.insert("channel".into(), Value::from(id));

        let envelope = CommandEnvelope::with_args(cmd, Role::Host, Value::Object(args));
        let result = bounded(self.timeout, Self::exchange(sink, &channel, envelope)).await;
        match &result {
            Ok(bytes) => debug!(channel = id, bytes = bytes.len(), "transfer received"),
            Err(e) => {
                debug!(channel = id, "transfer failed: {e}");
                channel.close();
            }
        }
        result
    }

    async fn exchange(
        sink: &dyn CommandSink,
        channel: &DynChannel,
        envelope: CommandEnvelope,
    ) -> Result<Vec<u8>, ShareError> {
        channel.opened().await?;
        sink.send_command(envelope).await?;

        let mut session = TransferSession::default();
        while let Some(frame) = channel.recv().await {
            if session.accept(frame) {
                channel.close();
            }
        }
        session.finish()
    }
}
