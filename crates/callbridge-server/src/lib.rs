//! The thin server between browsers and the native daemon.
//!
//! Each browser holds one WebSocket per account. Call signaling from a
//! browser is carried to the peer account through the daemon's account
//! message channel; conversation traffic is fanned out to the sockets
//! currently viewing a conversation.

pub mod config;
pub mod forward;
pub mod hub;
pub mod service;
pub mod ws;

pub use config::{Cli, ServerConfig};
pub use hub::{RelayHub, SocketId};
pub use service::{RunningServer, spawn_server};
