//! Control session: owns the negotiated control channel and dispatches
//! commands to the Host's content service or the Client's pending requests.
//!
//! The session is `Idle` until the control channel opens, `Ready` while it is
//! open, and `Finished` once its loop has stopped for good. A Host recreates a
//! closed control channel up to `control_reopen_limit` times; a Client stops
//! on the first close and fails whatever it was waiting for.

use crate::command::{
    self, AbstractArgs, Command, CommandEnvelope, EpisodeArgs, EpisodeReply, FetchArgs,
    MetaPayload, RemoteFailure, Role, PROTOCOL_VERSION,
};
use crate::config::SessionConfig;
use crate::error::ShareError;
use crate::remote::ClientState;
use crate::service::ContentService;
use crate::transfer::{CommandSink, TransferEngine, ABSTRACT_CHANNEL_LABEL, FILE_CHANNEL_LABEL};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use transport::{ChannelId, DynChannel, DynConnection, Frame, CONTROL_CHANNEL_ID};

/// Label of the channel older Hosts used to push meta.
pub const META_CHANNEL_LABEL: &str = "meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    Ready,
    Finished,
}

/// Role-specific command handling.
pub enum Dispatch {
    Host(Arc<ContentService>),
    Client(Arc<ClientState>),
}

impl Dispatch {
    fn role(&self) -> Role {
        match self {
            Dispatch::Host(_) => Role::Host,
            Dispatch::Client(_) => Role::Client,
        }
    }
}

/// Commands a peer sends are addressed to the other role, so one addressed
/// to our peer is our own message coming back.
fn is_self_echo(role: Role, target: Role) -> bool {
    target != Role::Unspecified && target == role.peer()
}

struct Inner {
    role: Role,
    connection: DynConnection,
    engine: TransferEngine,
    dispatch: Dispatch,
    reopen_limit: u32,
    control: RwLock<Option<DynChannel>>,
    state: watch::Sender<ControlState>,
    stop: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ControlSession {
    inner: Arc<Inner>,
}

impl ControlSession {
    pub fn host(
        connection: DynConnection,
        service: Arc<ContentService>,
        config: &SessionConfig,
    ) -> (Self, JoinHandle<()>) {
        Self::spawn(connection, Dispatch::Host(service), config)
    }

    pub fn client(
        connection: DynConnection,
        state: Arc<ClientState>,
        config: &SessionConfig,
    ) -> (Self, JoinHandle<()>) {
        Self::spawn(connection, Dispatch::Client(state), config)
    }

    /// Start the session loop on a new task.
    pub fn spawn(
        connection: DynConnection,
        dispatch: Dispatch,
        config: &SessionConfig,
    ) -> (Self, JoinHandle<()>) {
        let (state, _) = watch::channel(ControlState::Idle);
        let (stop, _) = watch::channel(false);
        let session = Self {
            inner: Arc::new(Inner {
                role: dispatch.role(),
                engine: TransferEngine::new(connection.clone(), config),
                connection,
                dispatch,
                reopen_limit: config.control_reopen_limit,
                control: RwLock::new(None),
                state,
                stop,
            }),
        };
        let handle = tokio::spawn(session.clone().run());
        (session, handle)
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ControlState {
        *self.inner.state.borrow()
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.inner.engine
    }

    /// Wait for the control channel to open. Errs once the session has finished.
    pub async fn wait_ready(&self) -> Result<(), ShareError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| *s != ControlState::Idle)
            .await
            .map(|s| *s)
            .unwrap_or(ControlState::Finished);
        match state {
            ControlState::Ready => Ok(()),
            _ => Err(ShareError::ChannelNotReady {
                channel: CONTROL_CHANNEL_ID,
            }),
        }
    }

    /// Close the control channel and stop the loop without reopening.
    pub fn shutdown(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Send a command. Dropped with `ChannelNotReady` unless the session is Ready.
    pub async fn send(&self, cmd: Command, target: Role, args: Value) -> Result<(), ShareError> {
        self.send_envelope(CommandEnvelope::with_args(cmd, target, args))
            .await
    }

    pub async fn send_envelope(&self, envelope: CommandEnvelope) -> Result<(), ShareError> {
        let control = self.inner.control.read().await.clone();
        let control = match control {
            Some(control) if control.is_open() => control,
            _ => {
                debug!(cmd = %envelope.cmd, "Dropping command, control channel not ready");
                return Err(ShareError::ChannelNotReady {
                    channel: CONTROL_CHANNEL_ID,
                });
            }
        };
        let text = command::encode(&envelope)?;
        control.send(Frame::Text(text)).await?;
        trace!(cmd = %envelope.cmd, target = ?envelope.target, "Command sent");
        Ok(())
    }

    async fn push_meta(&self, service: &ContentService) -> Result<(), ShareError> {
        let meta = serde_json::to_value(service.meta())?;
        self.send(Command::Meta, Role::Client, meta).await
    }

    async fn run(self) {
        let role = self.inner.role;
        let mut stop = self.inner.stop.subscribe();
        let mut reopened = 0;

        loop {
            let control = match self
                .inner
                .connection
                .open_control_channel(CONTROL_CHANNEL_ID)
                .await
            {
                Ok(control) => control,
                Err(e) => {
                    warn!("Failed to open control channel: {e}");
                    break;
                }
            };

            let opened = tokio::select! {
                opened = control.opened() => opened,
                _ = stopped(&mut stop) => {
                    control.close();
                    break;
                }
            };
            match opened {
                Ok(()) => self.serve(&control, &mut stop).await,
                Err(e) => warn!("Control channel failed to open: {e}"),
            }

            if *stop.borrow() || role != Role::Host || reopened >= self.inner.reopen_limit {
                break;
            }
            reopened += 1;
            info!(
                "Recreating control channel ({}/{})",
                reopened, self.inner.reopen_limit
            );
        }

        self.inner.state.send_replace(ControlState::Finished);
        if let Dispatch::Client(state) = &self.inner.dispatch {
            state.abort_pending().await;
        }
        info!("{:?} control session finished", role);
    }

    async fn serve(&self, control: &DynChannel, stop: &mut watch::Receiver<bool>) {
        *self.inner.control.write().await = Some(control.clone());
        self.inner.state.send_replace(ControlState::Ready);
        info!("Control channel ready as {:?}", self.inner.role);

        if let Dispatch::Host(service) = &self.inner.dispatch {
            if let Err(e) = self.push_meta(service).await {
                warn!("Failed to push meta: {e}");
            }
        }

        let mut accepting = true;
        loop {
            tokio::select! {
                biased;
                _ = stopped(stop) => {
                    control.close();
                    break;
                }
                incoming = self.inner.connection.accept_channel(), if accepting => match incoming {
                    Some(channel) => self.on_data_channel(channel).await,
                    None => accepting = false,
                },
                frame = control.recv() => match frame {
                    Some(Frame::Text(text)) => self.handle_frame(&text).await,
                    Some(Frame::Binary(data)) => {
                        warn!(bytes = data.len(), "Dropping binary frame on control channel");
                    }
                    None => {
                        info!("Control channel closed");
                        break;
                    }
                },
            }
        }

        *self.inner.control.write().await = None;
        self.inner.state.send_replace(ControlState::Idle);
    }

    async fn on_data_channel(&self, channel: DynChannel) {
        let label = channel.label().to_string();
        match (&self.inner.dispatch, label.as_str()) {
            (Dispatch::Host(_), FILE_CHANNEL_LABEL | ABSTRACT_CHANNEL_LABEL) => {
                self.inner.engine.register(channel).await;
            }
            (Dispatch::Client(state), META_CHANNEL_LABEL) => {
                tokio::spawn(receive_meta(channel, state.clone()));
            }
            _ => {
                debug!(channel = channel.id(), label = %label, "Ignoring data channel");
                channel.close();
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let envelope = match command::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping control frame: {}", ShareError::from(e));
                return;
            }
        };
        if is_self_echo(self.inner.role, envelope.target) {
            trace!(cmd = %envelope.cmd, "Ignoring self-addressed command");
            return;
        }
        if envelope.version > PROTOCOL_VERSION {
            debug!(version = envelope.version, "Command from a newer protocol version");
        }

        let cmd = envelope.cmd;
        if let Err(e) = self.dispatch(envelope).await {
            warn!(cmd = %cmd, "Command failed: {e}");
        }
    }

    async fn dispatch(&self, envelope: CommandEnvelope) -> Result<(), ShareError> {
        match (&self.inner.dispatch, envelope.cmd) {
            (Dispatch::Host(service), Command::Episode) => {
                let args: EpisodeArgs = envelope.args()?;
                // Listed inline so the scope is committed before later fetches run.
                let reply = match service.list_episode(args.scope).await {
                    Ok(descriptor) => EpisodeReply::ok(descriptor),
                    Err(e) => {
                        warn!(scope = args.scope, "Episode listing failed: {e}");
                        EpisodeReply::failed(RemoteFailure::from(&e))
                    }
                };
                self.send(Command::Episode, Role::Client, serde_json::to_value(&reply)?)
                    .await
            }
            (Dispatch::Host(service), Command::Fetch) => {
                let args: FetchArgs = self.transfer_args(&envelope).await?;
                let scope = args.scope.unwrap_or_else(|| service.scope());
                let index = args.index;
                debug!(scope, index, channel = args.channel, "Fetch requested");
                let service = service.clone();
                self.spawn_transfer(args.channel, async move {
                    service.fetch_file(scope, index).await
                });
                Ok(())
            }
            (Dispatch::Host(service), Command::Abstract) => {
                let args: AbstractArgs = self.transfer_args(&envelope).await?;
                let scope = args.scope.unwrap_or_else(|| service.scope());
                debug!(scope, channel = args.channel, "Abstract requested");
                let service = service.clone();
                self.spawn_transfer(args.channel, async move {
                    service.file_abstract(scope).await
                });
                Ok(())
            }
            (Dispatch::Host(service), Command::Meta) => self.push_meta(service).await,
            (Dispatch::Client(state), Command::Episode) => {
                state.resolve_episode(envelope.args()?).await;
                Ok(())
            }
            (Dispatch::Client(state), Command::Meta) => {
                state.on_meta(envelope.args()?);
                Ok(())
            }
            (_, cmd) => Err(ShareError::UnrecognizedCommand(format!(
                "{cmd} is not handled by {:?}",
                self.inner.role
            ))),
        }
    }

    /// Transfer arguments, abandoning the named channel when they do not parse.
    async fn transfer_args<T: DeserializeOwned>(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<T, ShareError> {
        match envelope.args() {
            Ok(args) => Ok(args),
            Err(e) => {
                let channel = envelope
                    .args
                    .get("channel")
                    .and_then(Value::as_u64)
                    .and_then(|id| ChannelId::try_from(id).ok());
                if let Some(channel) = channel {
                    self.inner.engine.abandon(channel).await;
                }
                Err(e.into())
            }
        }
    }

    /// Produce the payload off the control loop and send it on `channel`.
    fn spawn_transfer<F>(&self, channel: ChannelId, payload: F)
    where
        F: Future<Output = Result<Vec<u8>, ShareError>> + Send + 'static,
    {
        let session = self.clone();
        tokio::spawn(async move {
            let engine = &session.inner.engine;
            let sent = match payload.await {
                Ok(bytes) => engine.transmit(&bytes, channel).await,
                Err(e) => {
                    warn!(channel, "Request failed: {e}");
                    engine.transmit_failure(channel, RemoteFailure::from(&e)).await
                }
            };
            if let Err(e) = sent {
                warn!(channel, "Transfer failed: {e}");
            }
        });
    }
}

#[async_trait]
impl CommandSink for ControlSession {
    async fn send_command(&self, envelope: CommandEnvelope) -> Result<(), ShareError> {
        self.send_envelope(envelope).await
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn receive_meta(channel: DynChannel, state: Arc<ClientState>) {
    while let Some(frame) = channel.recv().await {
        if let Frame::Text(text) = frame {
            match serde_json::from_str::<MetaPayload>(&text) {
                Ok(meta) => {
                    state.on_meta(meta);
                    break;
                }
                Err(e) => debug!("Ignoring frame on meta channel: {e}"),
            }
        }
    }
    channel.close();
}
