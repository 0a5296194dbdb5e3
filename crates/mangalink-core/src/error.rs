use crate::command::{DecodeError, RemoteFailure};
use thiserror::Error;
use transport::{ChannelError, ChannelId};

/// Failures surfaced by the session, transfer engine and content services.
///
/// None of these is fatal to the connection: decode failures are dropped at
/// the session boundary, and transfer failures reject only the request they
/// belong to.
#[derive(Error, Debug)]
pub enum ShareError {
    #[error("channel {channel} is not ready")]
    ChannelNotReady { channel: ChannelId },

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("unrecognized command: {0}")]
    UnrecognizedCommand(String),

    #[error("file index {index} out of range ({length} files)")]
    IndexOutOfRange { index: u32, length: u32 },

    #[error("episode {scope} out of range ({count} episodes)")]
    ScopeOutOfRange { scope: u32, count: u32 },

    #[error("transfer incomplete: received {received} of {expected:?} bytes")]
    IncompleteTransfer { expected: Option<u64>, received: u64 },

    #[error("an episode request is already in flight")]
    RequestAlreadyInFlight,

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("peer failed the request: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(ChannelError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Content(#[from] anyhow::Error),
}

impl From<ChannelError> for ShareError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotOpen(channel) | ChannelError::Closed(channel) => {
                ShareError::ChannelNotReady { channel }
            }
            other => ShareError::Transport(other),
        }
    }
}

impl From<DecodeError> for ShareError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Malformed(reason) => ShareError::MalformedCommand(reason),
            DecodeError::Unrecognized(cmd) => ShareError::UnrecognizedCommand(cmd),
        }
    }
}

impl From<RemoteFailure> for ShareError {
    fn from(failure: RemoteFailure) -> Self {
        match failure {
            RemoteFailure::IndexOutOfRange { index, length } => {
                ShareError::IndexOutOfRange { index, length }
            }
            RemoteFailure::ScopeOutOfRange { scope, count } => {
                ShareError::ScopeOutOfRange { scope, count }
            }
            RemoteFailure::Unavailable { message } => ShareError::Remote(message),
        }
    }
}

impl From<&ShareError> for RemoteFailure {
    fn from(err: &ShareError) -> Self {
        match err {
            ShareError::IndexOutOfRange { index, length } => RemoteFailure::IndexOutOfRange {
                index: *index,
                length: *length,
            },
            ShareError::ScopeOutOfRange { scope, count } => RemoteFailure::ScopeOutOfRange {
                scope: *scope,
                count: *count,
            },
            other => RemoteFailure::Unavailable {
                message: other.to_string(),
            },
        }
    }
}
