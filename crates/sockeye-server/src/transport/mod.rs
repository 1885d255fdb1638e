//! Transport layer: byte-oriented session endpoints over HTTP.
//!
//! Both transports yield the same [`Connection`] seam, which is all the
//! channel lifecycle ever sees. The websocket transport maps one packet to
//! one text frame; the polling transport emulates a duplex stream over
//! paired GET (read) and POST (write) requests.

use std::time::Duration;

use async_trait::async_trait;
use sockeye_core::Result;

pub mod polling;
pub mod websocket;

pub use polling::{PollingClientConnection, PollingConnection, PollingTransport};
pub use websocket::{WebsocketConnection, WebsocketTransport, WsClientConnection};

/// Control sentinel: releases a parked polling reader after the connection
/// was retired.
pub const STOP_MESSAGE: &str = "stop";
/// Alternate retirement sentinel; treated exactly like [`STOP_MESSAGE`].
pub const UPGRADED_MESSAGE: &str = "upgrade";

/// A byte-oriented session endpoint produced by a transport.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Wait for the next inbound packet text.
    async fn get_message(&self) -> Result<String>;

    /// Deliver one packet text to the peer.
    async fn write_message(&self, message: String) -> Result<()>;

    /// Tear the endpoint down. Idempotent.
    async fn close(&self);

    /// `(ping_interval, ping_timeout)` advertised in the open payload.
    fn ping_params(&self) -> (Duration, Duration);
}
