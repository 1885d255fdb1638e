//! sockeye umbrella crate: one import surface for the protocol core and the
//! server.

pub use sockeye_core::error::{Result, SockeyeError};
pub use sockeye_core::protocol::{OpenPayload, Packet};

pub use sockeye_server::channel::Channel;
pub use sockeye_server::config::{self, PollingConfig, ServerConfig, WebsocketConfig};
pub use sockeye_server::events::{ON_CONNECTION, ON_DISCONNECTION, ON_ERROR};
pub use sockeye_server::server::Server;
pub use sockeye_server::transport::{Connection, PollingTransport, WebsocketTransport};
