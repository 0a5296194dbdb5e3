//! Client-side view of the Host's content.
//!
//! Episode listings go over the control channel and resolve a single pending
//! slot; file and abstract fetches each open their own data channel.

use crate::command::{Command, EpisodeDescriptor, EpisodeReply, MetaPayload, Role};
use crate::config::SessionConfig;
use crate::error::ShareError;
use crate::session::ControlSession;
use crate::transfer::{bounded, ABSTRACT_CHANNEL_LABEL, FILE_CHANNEL_LABEL};
use crate::view::{ContentView, Library};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport::{DynConnection, CONTROL_CHANNEL_ID};

type EpisodeResult = Result<EpisodeDescriptor, ShareError>;

struct PendingEpisode {
    scope: u32,
    reply: oneshot::Sender<EpisodeResult>,
}

/// State the Client's control session resolves into.
pub struct ClientState {
    pending: Mutex<Option<PendingEpisode>>,
    scope: AtomicU32,
    episode_length: AtomicU32,
    meta: watch::Sender<Option<MetaPayload>>,
}

impl Default for ClientState {
    fn default() -> Self {
        let (meta, _) = watch::channel(None);
        Self {
            pending: Mutex::new(None),
            scope: AtomicU32::new(0),
            episode_length: AtomicU32::new(0),
            meta,
        }
    }
}

impl ClientState {
    /// Claim the pending slot. A slot whose waiter has gone away counts as free.
    async fn begin_episode(&self, scope: u32) -> Result<oneshot::Receiver<EpisodeResult>, ShareError> {
        let mut slot = self.pending.lock().await;
        if slot.as_ref().is_some_and(|p| !p.reply.is_closed()) {
            return Err(ShareError::RequestAlreadyInFlight);
        }
        let (reply, rx) = oneshot::channel();
        *slot = Some(PendingEpisode { scope, reply });
        Ok(rx)
    }

    pub(crate) async fn resolve_episode(&self, reply: EpisodeReply) {
        let Some(pending) = self.pending.lock().await.take() else {
            warn!("Episode reply with no request pending");
            return;
        };

        let outcome = match reply.error {
            Some(failure) => Err(failure.into()),
            None => {
                self.scope.store(pending.scope, Ordering::SeqCst);
                self.episode_length
                    .store(reply.descriptor.length, Ordering::SeqCst);
                debug!(
                    scope = pending.scope,
                    files = reply.descriptor.length,
                    "Episode loaded"
                );
                Ok(reply.descriptor)
            }
        };
        if pending.reply.send(outcome).is_err() {
            debug!(scope = pending.scope, "Episode reply arrived after the caller gave up");
        }
    }

    pub(crate) async fn abort_pending(&self) {
        if let Some(pending) = self.pending.lock().await.take() {
            let _ = pending.reply.send(Err(ShareError::ChannelNotReady {
                channel: CONTROL_CHANNEL_ID,
            }));
        }
    }

    pub(crate) fn on_meta(&self, meta: MetaPayload) {
        info!(
            "Host is sharing {:?} \"{}\" ({} episodes)",
            meta.content_type,
            meta.manga,
            meta.episode_names.as_ref().map_or(0, Vec::len)
        );
        self.meta.send_replace(Some(meta));
    }
}

#[derive(Clone)]
pub struct RemoteContentClient {
    session: ControlSession,
    state: Arc<ClientState>,
    timeout: Option<Duration>,
    abstract_prefix_len: usize,
}

impl RemoteContentClient {
    /// Start a Client session on `connection`.
    pub fn connect(connection: DynConnection, config: &SessionConfig) -> (Self, JoinHandle<()>) {
        let state = Arc::new(ClientState::default());
        let (session, handle) = ControlSession::client(connection, state.clone(), config);
        let client = Self {
            session,
            state,
            timeout: config.request_timeout(),
            abstract_prefix_len: config.abstract_prefix_len.max(1),
        };
        (client, handle)
    }

    pub fn session(&self) -> &ControlSession {
        &self.session
    }

    /// Episode of the last successful load.
    pub fn current_scope(&self) -> u32 {
        self.state.scope.load(Ordering::SeqCst)
    }

    /// Load an episode on the Host and make it current; returns its file count.
    pub async fn load_episode(&self, scope: u32) -> Result<u32, ShareError> {
        Ok(self.episode(scope).await?.length)
    }

    pub async fn episode(&self, scope: u32) -> Result<EpisodeDescriptor, ShareError> {
        let reply = self.state.begin_episode(scope).await?;
        self.session
            .send(Command::Episode, Role::Host, json!({ "scope": scope }))
            .await?;

        let waiting = async {
            reply.await.unwrap_or(Err(ShareError::ChannelNotReady {
                channel: CONTROL_CHANNEL_ID,
            }))
        };
        bounded(self.timeout, waiting).await
    }

    /// File `index` of the current episode.
    pub async fn fetch_file(&self, index: u32) -> Result<Vec<u8>, ShareError> {
        self.fetch_in(self.current_scope(), index).await
    }

    pub async fn fetch_in(&self, scope: u32, index: u32) -> Result<Vec<u8>, ShareError> {
        let mut args = Map::new();
        args.insert("scope".into(), Value::from(scope));
        args.insert("index".into(), Value::from(index));
        self.session
            .engine()
            .request(&self.session, FILE_CHANNEL_LABEL, Command::Fetch, args)
            .await
    }

    /// Leading bytes of every file of the current episode, one slice per file.
    pub async fn fetch_abstracts(&self) -> Result<Vec<Vec<u8>>, ShareError> {
        let mut args = Map::new();
        args.insert("scope".into(), Value::from(self.current_scope()));
        let data = self
            .session
            .engine()
            .request(&self.session, ABSTRACT_CHANNEL_LABEL, Command::Abstract, args)
            .await?;

        let stride = self.abstract_prefix_len;
        let count = self.state.episode_length.load(Ordering::SeqCst) as usize;
        Ok((0..count)
            .map(|i| {
                let start = (i * stride).min(data.len());
                let end = (start + stride).min(data.len());
                data[start..end].to_vec()
            })
            .collect())
    }

    /// Ask the Host to push its meta again.
    pub async fn request_meta(&self) -> Result<(), ShareError> {
        self.session.send(Command::Meta, Role::Host, Value::Null).await
    }

    /// Latest meta pushed by the Host.
    pub fn meta(&self) -> Option<MetaPayload> {
        self.state.meta.borrow().clone()
    }

    pub async fn wait_meta(&self) -> Result<MetaPayload, ShareError> {
        let mut rx = self.state.meta.subscribe();
        let waiting = async move {
            let meta = rx.wait_for(Option::is_some).await.map(|m| m.clone());
            meta.ok()
                .flatten()
                .ok_or(ShareError::ChannelNotReady {
                    channel: CONTROL_CHANNEL_ID,
                })
        };
        bounded(self.timeout, waiting).await
    }

    /// Mirror of the Host's content, once meta has arrived.
    pub fn view(&self) -> Option<ContentView> {
        self.meta().as_ref().and_then(ContentView::from_meta)
    }
}

#[async_trait]
impl Library for RemoteContentClient {
    async fn list_episode(&self, scope: u32) -> Result<EpisodeDescriptor, ShareError> {
        self.episode(scope).await
    }

    async fn fetch(&self, scope: u32, index: u32) -> Result<Vec<u8>, ShareError> {
        self.fetch_in(scope, index).await
    }

    fn view(&self) -> Option<ContentView> {
        RemoteContentClient::view(self)
    }
}
