//! Control-channel command envelopes and the frames that lead a data channel.
//!
//! An envelope is a flat JSON object: `{"cmd": "...", "target": 0|1|2, "args": {...}}`.
//! `version` is written on encode and defaults to the current protocol
//! version when a peer omits it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use transport::ChannelId;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Episode,
    Fetch,
    Meta,
    Abstract,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Episode => "episode",
            Command::Fetch => "fetch",
            Command::Meta => "meta",
            Command::Abstract => "abstract",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "episode" => Some(Command::Episode),
            "fetch" => Some(Command::Fetch),
            "meta" => Some(Command::Meta),
            "abstract" => Some(Command::Abstract),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the connection a peer plays. Encoded as 0, 1, 2 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Role {
    Host,
    Client,
    Unspecified,
}

impl Role {
    /// The role on the other end of the connection.
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Client,
            Role::Client => Role::Host,
            Role::Unspecified => Role::Unspecified,
        }
    }
}

impl From<Role> for u8 {
    fn from(role: Role) -> u8 {
        match role {
            Role::Host => 0,
            Role::Client => 1,
            Role::Unspecified => 2,
        }
    }
}

impl TryFrom<u8> for Role {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Host),
            1 => Ok(Role::Client),
            2 => Ok(Role::Unspecified),
            other => Err(format!("unknown role {other}")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unrecognized command {0:?}")]
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandEnvelope {
    pub version: u32,
    pub cmd: Command,
    pub target: Role,
    pub args: Value,
}

impl CommandEnvelope {
    pub fn with_args(cmd: Command, target: Role, args: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            cmd,
            target,
            args,
        }
    }

    pub fn new<T: Serialize>(cmd: Command, target: Role, args: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::with_args(cmd, target, serde_json::to_value(args)?))
    }

    /// Interpret `args` as the typed arguments of this command.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| DecodeError::Malformed(format!("{} args: {e}", self.cmd)))
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default = "current_version")]
    version: u32,
    cmd: Option<String>,
    target: Option<Value>,
    #[serde(default)]
    args: Value,
}

fn current_version() -> u32 {
    PROTOCOL_VERSION
}

pub fn encode(envelope: &CommandEnvelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

pub fn decode(text: &str) -> Result<CommandEnvelope, DecodeError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let name = raw
        .cmd
        .ok_or_else(|| DecodeError::Malformed("missing cmd".into()))?;
    let target = raw
        .target
        .ok_or_else(|| DecodeError::Malformed("missing target".into()))?;
    let target: Role = serde_json::from_value(target)
        .map_err(|e| DecodeError::Malformed(format!("target: {e}")))?;
    let cmd = Command::parse(&name).ok_or(DecodeError::Unrecognized(name))?;

    Ok(CommandEnvelope {
        version: raw.version,
        cmd,
        target,
        args: raw.args,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeArgs {
    #[serde(alias = "index")]
    pub scope: u32,
}

/// Arguments of a Fetch. Without `scope` the Host uses its shared scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<u32>,
    pub index: u32,
    pub channel: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<u32>,
    pub channel: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeDescriptor {
    pub name: String,
    pub length: u32,
}

/// Host's answer to an Episode request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeReply {
    #[serde(flatten)]
    pub descriptor: EpisodeDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,
}

impl EpisodeReply {
    pub fn ok(descriptor: EpisodeDescriptor) -> Self {
        Self {
            descriptor,
            error: None,
        }
    }

    pub fn failed(failure: RemoteFailure) -> Self {
        Self {
            descriptor: EpisodeDescriptor {
                name: String::new(),
                length: 0,
            },
            error: Some(failure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ContentType {
    Undefined,
    Episode,
    Manga,
}

impl From<ContentType> for u8 {
    fn from(kind: ContentType) -> u8 {
        match kind {
            ContentType::Undefined => 0,
            ContentType::Episode => 1,
            ContentType::Manga => 2,
        }
    }
}

impl TryFrom<u8> for ContentType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ContentType::Undefined),
            1 => Ok(ContentType::Episode),
            2 => Ok(ContentType::Manga),
            other => Err(format!("unknown content type {other}")),
        }
    }
}

/// What the Host is sharing, pushed to the Client whenever control becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaPayload {
    pub manga: String,
    pub episode: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_names: Option<Vec<String>>,
}

/// First text frame on a data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferHeader {
    Meta { size: u64 },
    Error { reason: RemoteFailure },
}

/// A request the Host could not serve, reported in place of data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteFailure {
    IndexOutOfRange { index: u32, length: u32 },
    ScopeOutOfRange { scope: u32, count: u32 },
    Unavailable { message: String },
}
