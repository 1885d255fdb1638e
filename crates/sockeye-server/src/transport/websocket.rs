//! Websocket transport: server side over an upgraded axum socket, client
//! side over a tungstenite dial.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::http::{header, HeaderMap};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use sockeye_core::{Result, SockeyeError};

use crate::config::WebsocketConfig;
use crate::transport::Connection;

type OriginCheck = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Websocket transport parameters shared by every connection it produces.
pub struct WebsocketTransport {
    config: WebsocketConfig,
    check_origin: Option<OriginCheck>,
}

impl WebsocketTransport {
    pub fn new(config: WebsocketConfig) -> Self {
        Self {
            config,
            check_origin: None,
        }
    }

    /// Install a server-side origin check. Without one, cross-origin upgrade
    /// requests are rejected.
    pub fn with_check_origin(
        mut self,
        check: impl Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.check_origin = Some(Arc::new(check));
        self
    }

    pub fn config(&self) -> &WebsocketConfig {
        &self.config
    }

    pub(crate) fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        if let Some(check) = &self.check_origin {
            return check(headers);
        }
        let Some(origin) = headers.get(header::ORIGIN) else {
            return true;
        };
        let (Ok(origin), Some(Ok(host))) = (origin.to_str(), headers.get(header::HOST).map(|h| h.to_str()))
        else {
            return false;
        };
        let origin_host = origin.split_once("://").map_or(origin, |(_, h)| h);
        origin_host == host
    }

    /// Wrap an already-upgraded server-side socket.
    pub(crate) fn wrap(&self, socket: WebSocket) -> Arc<WebsocketConnection> {
        let (tx, rx) = socket.split();
        Arc::new(WebsocketConnection {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            config: self.config.clone(),
        })
    }

    /// Dial a remote server, presenting the configured extra headers.
    pub async fn connect(&self, url: &str) -> Result<Arc<WsClientConnection>> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SockeyeError::UpgradeFailed(e.to_string()))?;
        for (name, value) in &self.config.headers {
            let name: header::HeaderName = name
                .parse()
                .map_err(|_| SockeyeError::BadConfig(format!("bad header name {name:?}")))?;
            let value = value
                .parse()
                .map_err(|_| SockeyeError::BadConfig(format!("bad header value for {name}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SockeyeError::UpgradeFailed(e.to_string()))?;
        let (tx, rx) = stream.split();
        Ok(Arc::new(WsClientConnection {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            config: self.config.clone(),
        }))
    }
}

/// Server-side websocket connection.
pub struct WebsocketConnection {
    tx: Mutex<SplitSink<WebSocket, Message>>,
    rx: Mutex<SplitStream<WebSocket>>,
    config: WebsocketConfig,
}

#[async_trait]
impl Connection for WebsocketConnection {
    async fn get_message(&self) -> Result<String> {
        let mut rx = self.rx.lock().await;
        loop {
            let frame = timeout(self.config.receive_timeout(), rx.next())
                .await
                .map_err(|_| SockeyeError::ReadTimeout)?
                .ok_or(SockeyeError::ChannelClosed)?
                .map_err(|e| SockeyeError::TransportIo(e.to_string()))?;

            match frame {
                Message::Text(text) if text.is_empty() => return Err(SockeyeError::EmptyFrame),
                Message::Text(text) => return Ok(text),
                Message::Binary(_) => return Err(SockeyeError::BinaryNotSupported),
                Message::Close(_) => return Err(SockeyeError::ChannelClosed),
                // Socket-level control frames are not protocol packets.
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    async fn write_message(&self, message: String) -> Result<()> {
        let mut tx = self.tx.lock().await;
        timeout(self.config.send_timeout(), tx.send(Message::Text(message)))
            .await
            .map_err(|_| SockeyeError::WriteTimeout)?
            .map_err(|e| SockeyeError::TransportIo(e.to_string()))
    }

    async fn close(&self) {
        let mut tx = self.tx.lock().await;
        let _ = tx.close().await;
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.config.ping_interval(), self.config.ping_timeout())
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientMessage = tokio_tungstenite::tungstenite::Message;

/// Client-side websocket connection obtained from [`WebsocketTransport::connect`].
pub struct WsClientConnection {
    tx: Mutex<SplitSink<ClientStream, ClientMessage>>,
    rx: Mutex<SplitStream<ClientStream>>,
    config: WebsocketConfig,
}

#[async_trait]
impl Connection for WsClientConnection {
    async fn get_message(&self) -> Result<String> {
        let mut rx = self.rx.lock().await;
        loop {
            let frame = timeout(self.config.receive_timeout(), rx.next())
                .await
                .map_err(|_| SockeyeError::ReadTimeout)?
                .ok_or(SockeyeError::ChannelClosed)?
                .map_err(|e| SockeyeError::TransportIo(e.to_string()))?;

            match frame {
                ClientMessage::Text(text) if text.is_empty() => {
                    return Err(SockeyeError::EmptyFrame)
                }
                ClientMessage::Text(text) => return Ok(text),
                ClientMessage::Binary(_) => return Err(SockeyeError::BinaryNotSupported),
                ClientMessage::Close(_) => return Err(SockeyeError::ChannelClosed),
                _ => continue,
            }
        }
    }

    async fn write_message(&self, message: String) -> Result<()> {
        let mut tx = self.tx.lock().await;
        timeout(
            self.config.send_timeout(),
            tx.send(ClientMessage::Text(message)),
        )
        .await
        .map_err(|_| SockeyeError::WriteTimeout)?
        .map_err(|e| SockeyeError::TransportIo(e.to_string()))
    }

    async fn close(&self) {
        let mut tx = self.tx.lock().await;
        let _ = tx.close().await;
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.config.ping_interval(), self.config.ping_timeout())
    }
}
