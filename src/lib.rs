//! Always-on group-chat client for XMPP-based chat services.
//!
//! [`Client::connect`] dials the server, negotiates TLS and authentication,
//! and hands back a cloneable [`Client`] plus the inbound [`Events`]
//! streams. A background supervisor keeps the session alive and reconnects
//! on failure.

pub mod attachment;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod model;
pub mod negotiator;
pub mod supervisor;
pub mod xmpp;

#[cfg(test)]
mod test_support;

pub use client::{Client, Events};
pub use config::{AuthMode, ClientConfig, KeepAlive, ReconnectPolicy};
pub use error::{Error, Result};
pub use model::{Attachment, Message, Room, User};
pub use supervisor::SessionEvent;
