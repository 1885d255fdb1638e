//! sockeye server library.
//!
//! This crate assembles the messaging server core:
//! - Transports: websocket (axum upgrade + tungstenite dial) and HTTP
//!   long-polling, both yielding the same byte-oriented [`transport::Connection`]
//!   endpoint, with seamless polling → websocket upgrade under one sid.
//! - Channel: per-client session state machine with inbound/outbound tasks,
//!   timer-driven liveness and ack correlation.
//! - Dispatch: typed event handlers registered by name, invoked inline on the
//!   owning channel's inbound loop.
//! - Rooms: membership registry with snapshot-then-spawn broadcast fan-out.
//! - Server façade: axum route handling session creation and upgrade routing.
//!
//! The server is designed for panic-free operation: handler panics are
//! contained to the current dispatch, transport errors retire only the owning
//! channel.

mod ack;
mod rooms;
mod sid;

#[cfg(test)]
pub(crate) mod testutil;

pub mod channel;
pub mod config;
pub mod events;
pub mod server;
pub mod transport;

pub use channel::Channel;
pub use config::{PollingConfig, ServerConfig, WebsocketConfig};
pub use events::{ON_CONNECTION, ON_DISCONNECTION, ON_ERROR};
pub use server::Server;
pub use transport::{Connection, PollingTransport, WebsocketTransport};
