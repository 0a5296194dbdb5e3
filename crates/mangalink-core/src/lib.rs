//! MangaLink Core - peer-to-peer content sharing between one Host and one Client.
//!
//! The Host serves a content tree (a manga of episodes, or a single collection
//! of files); the Client lists episodes and pulls files over a peer connection.
//! Commands travel on a negotiated control channel, bulk bytes on one data
//! channel per transfer with buffered-amount flow control.

pub mod command;
pub mod config;
pub mod error;
pub mod remote;
pub mod service;
pub mod session;
pub mod transfer;
pub mod view;

#[cfg(test)]
mod scenarios;

// Re-export commonly used types
pub use command::{CommandEnvelope, ContentType, EpisodeDescriptor, MetaPayload, Role};
pub use config::SessionConfig;
pub use error::ShareError;
pub use remote::RemoteContentClient;
pub use service::{ContentService, HostContent};
pub use session::{ControlSession, ControlState};
pub use transfer::TransferEngine;
pub use view::{ContentView, Library, Shelf};
