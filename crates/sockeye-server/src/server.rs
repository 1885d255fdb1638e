//! Server façade: HTTP entry, session creation, upgrade routing and the
//! process-wide registries.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use sockeye_core::protocol::{with_length, OpenPayload, Packet};
use sockeye_core::{Result, SockeyeError};

use crate::channel::{encode_args, Channel};
use crate::config::ServerConfig;
use crate::events::{EventRegistry, IntoAckHandler, IntoEventHandler};
use crate::rooms::RoomRegistry;
use crate::sid;
use crate::transport::{Connection, PollingTransport, WebsocketTransport};

/// Conventional mount point for the protocol endpoint.
pub const DEFAULT_PATH: &str = "/socket.io/";

/// The messaging server. Cheap to clone; all clones share one set of
/// registries.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) websocket: WebsocketTransport,
    pub(crate) polling: PollingTransport,
    pub(crate) sids: DashMap<String, Arc<Channel>>,
    pub(crate) rooms: RoomRegistry,
    pub(crate) events: EventRegistry,
}

impl Server {
    pub fn new(websocket: WebsocketTransport, polling: PollingTransport) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                websocket,
                polling,
                sids: DashMap::new(),
                rooms: RoomRegistry::default(),
                events: EventRegistry::default(),
            }),
        }
    }

    /// Server with default transport parameters.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        Self::new(
            WebsocketTransport::new(config.websocket),
            PollingTransport::new(config.polling),
        )
    }

    pub fn from_config(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            WebsocketTransport::new(config.websocket),
            PollingTransport::new(config.polling),
        ))
    }

    /// Register a plain event handler (arity 0 or 1). System event names
    /// accept only arity-0 handlers.
    pub fn on<A>(&self, name: &str, handler: impl IntoEventHandler<A>) -> Result<()> {
        self.inner.events.on(name, handler)
    }

    /// Register a handler whose return value answers ack requests for
    /// `name`.
    pub fn on_ack<A>(&self, name: &str, handler: impl IntoAckHandler<A>) -> Result<()> {
        self.inner.events.on_ack(name, handler)
    }

    /// Look a channel up by its sid.
    pub fn get_channel(&self, sid: &str) -> Result<Arc<Channel>> {
        self.inner.get(sid).ok_or(SockeyeError::ConnectionNotFound)
    }

    /// Fan an event out to every member of the room. Never fails;
    /// per-recipient errors are absorbed.
    pub fn broadcast_to<T: Serialize + ?Sized>(&self, room: &str, name: &str, payload: &T) {
        self.inner.broadcast(room, name, payload, None);
    }

    /// Fan an event out to every connected channel.
    pub fn broadcast_to_all<T: Serialize + ?Sized>(&self, name: &str, payload: &T) {
        self.inner.broadcast_all(name, payload);
    }

    /// Number of channels joined to the room.
    pub fn amount(&self, room: &str) -> usize {
        self.inner.rooms.amount(room)
    }

    /// Snapshot of the room's members.
    pub fn list(&self, room: &str) -> Vec<Arc<Channel>> {
        self.inner.rooms.members(room)
    }

    /// Number of connected channels.
    pub fn count_channels(&self) -> usize {
        self.inner.sids.len()
    }

    /// Number of rooms with at least one member.
    pub fn count_rooms(&self) -> usize {
        self.inner.rooms.count_rooms()
    }

    /// Axum router exposing the protocol endpoint at [`DEFAULT_PATH`].
    /// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`
    /// so channels see their peer address.
    pub fn router(&self) -> Router {
        Router::new()
            .route(DEFAULT_PATH, get(serve_get).post(serve_post))
            .with_state(self.inner.clone())
    }
}

impl ServerInner {
    pub(crate) fn get(&self, sid: &str) -> Option<Arc<Channel>> {
        self.sids.get(sid).map(|e| e.value().clone())
    }

    /// Disconnect cleanup: rooms first, then the sid index. Entries taken
    /// over by an upgrade replacement are left in place.
    pub(crate) fn unregister(&self, channel: &Arc<Channel>) {
        self.rooms.purge(channel);
        self.sids
            .remove_if(channel.id(), |_, current| Arc::ptr_eq(current, channel));
    }

    pub(crate) fn broadcast<T: Serialize + ?Sized>(
        &self,
        room: &str,
        name: &str,
        payload: &T,
        exclude: Option<&str>,
    ) {
        let Ok(args) = encode_args(payload) else {
            tracing::warn!(event = name, "broadcast payload serialization failed");
            return;
        };
        let message = Packet::Event {
            name: name.to_string(),
            args,
        }
        .encode();
        fan_out(self.rooms.members(room), message, exclude);
    }

    pub(crate) fn broadcast_all<T: Serialize + ?Sized>(&self, name: &str, payload: &T) {
        let Ok(args) = encode_args(payload) else {
            tracing::warn!(event = name, "broadcast payload serialization failed");
            return;
        };
        let message = Packet::Event {
            name: name.to_string(),
            args,
        }
        .encode();
        let members: Vec<Arc<Channel>> = self.sids.iter().map(|e| e.value().clone()).collect();
        fan_out(members, message, None);
    }

    /// New polling session: create the channel, register it, and hand the
    /// open sequence back as the body of the in-flight GET.
    pub(crate) async fn setup_polling(
        self: &Arc<Self>,
        remote_addr: String,
        headers: HeaderMap,
    ) -> Result<String> {
        let conn = self.polling.handle_connection();
        let (interval, timeout) = conn.ping_params();
        let payload = OpenPayload {
            sid: sid::generate(&remote_addr),
            upgrades: vec!["websocket".to_string()],
            ping_interval: interval.as_millis() as u64,
            ping_timeout: timeout.as_millis() as u64,
        };
        self.polling.set_sid(&payload.sid, &conn);

        let channel = Channel::new(
            conn,
            remote_addr,
            headers,
            Arc::downgrade(self),
            payload,
            true,
            self.polling.config().send_timeout(),
        );
        self.sids.insert(channel.id().to_string(), channel.clone());
        channel.start();
        channel.fire_connection_once().await;
        tracing::debug!(sid = %channel.id(), "created polling session");

        let open = Packet::Open(channel.open_payload().to_json()?).encode();
        Ok(format!(
            "{}{}",
            with_length(&open),
            with_length(&Packet::Noop.encode())
        ))
    }

    /// New websocket session: open sequence goes through the outbound queue
    /// as two text frames.
    pub(crate) async fn setup_websocket(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        remote_addr: String,
        headers: HeaderMap,
    ) -> Result<Arc<Channel>> {
        let (interval, timeout) = conn.ping_params();
        let payload = OpenPayload {
            sid: sid::generate(&remote_addr),
            upgrades: Vec::new(),
            ping_interval: interval.as_millis() as u64,
            ping_timeout: timeout.as_millis() as u64,
        };
        let channel = Channel::new(
            conn,
            remote_addr,
            headers,
            Arc::downgrade(self),
            payload,
            true,
            self.websocket.config().send_timeout(),
        );
        self.sids.insert(channel.id().to_string(), channel.clone());
        channel.send_open_sequence().await?;
        channel.start();
        channel.fire_connection_once().await;
        tracing::debug!(sid = %channel.id(), "created websocket session");
        Ok(channel)
    }

    /// Transport upgrade: a websocket request arrived for an existing
    /// polling sid. The replacement takes over the sid index and every room
    /// membership before the retired channel is stubbed.
    pub(crate) async fn adopt_upgrade(
        self: &Arc<Self>,
        sid: &str,
        conn: Arc<dyn Connection>,
        remote_addr: String,
        headers: HeaderMap,
    ) {
        let Some(old) = self.get(sid) else {
            tracing::warn!(%sid, "upgrade request for unknown session");
            return;
        };
        let (interval, timeout) = conn.ping_params();
        let payload = OpenPayload {
            sid: sid.to_string(),
            upgrades: Vec::new(),
            ping_interval: interval.as_millis() as u64,
            ping_timeout: timeout.as_millis() as u64,
        };
        let channel = Channel::new(
            conn,
            remote_addr,
            headers,
            Arc::downgrade(self),
            payload,
            false,
            self.websocket.config().send_timeout(),
        );
        channel.start();

        self.rooms.rebind(sid, &channel);
        self.sids.insert(sid.to_string(), channel.clone());

        // Stubbing waits for the probe ping on the new transport so the
        // retired long-poll writer is released only after the handoff.
        if tokio::time::timeout(channel.ping_timeout(), channel.wait_upgraded())
            .await
            .is_err()
        {
            tracing::warn!(%sid, "upgrade probe never arrived");
        }
        old.stub().await;
        tracing::debug!(%sid, upgraded = channel.is_upgraded(), "polling channel retired");
    }
}

fn fan_out(members: Vec<Arc<Channel>>, message: String, exclude: Option<&str>) {
    for channel in members {
        if exclude == Some(channel.id()) || !channel.is_alive() {
            continue;
        }
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.enqueue(message).await {
                tracing::debug!(sid = %channel.id(), %e, "broadcast recipient dropped");
            }
        });
    }
}

#[derive(Debug, Deserialize)]
struct TransportQuery {
    #[serde(default)]
    transport: String,
    #[serde(default)]
    sid: Option<String>,
}

async fn serve_get(
    State(inner): State<Arc<ServerInner>>,
    Query(query): Query<TransportQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let remote_addr = remote_addr(&connect_info);
    match query.transport.as_str() {
        "polling" => {
            let result = match query.sid {
                // Follow-up poll of an existing session.
                Some(sid) => inner.polling.serve_get(&sid).await,
                // First contact: handshake + open sequence.
                None => inner.setup_polling(remote_addr, headers).await,
            };
            match result {
                Ok(body) => polling_response(&inner, body),
                Err(e) => error_response(e),
            }
        }
        "websocket" => {
            let Some(ws) = ws else {
                return error_response(SockeyeError::UpgradeFailed(
                    "not a websocket upgrade request".into(),
                ));
            };
            if !inner.websocket.origin_allowed(&headers) {
                return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
            }
            match query.sid {
                None => ws.on_upgrade(move |socket| async move {
                    let conn = inner.websocket.wrap(socket);
                    if let Err(e) = inner.setup_websocket(conn, remote_addr, headers).await {
                        tracing::warn!(%e, "websocket session setup failed");
                    }
                }),
                Some(sid) => ws.on_upgrade(move |socket| async move {
                    let conn = inner.websocket.wrap(socket);
                    inner.adopt_upgrade(&sid, conn, remote_addr, headers).await;
                }),
            }
        }
        other => (
            StatusCode::BAD_REQUEST,
            format!("unknown transport {other:?}"),
        )
            .into_response(),
    }
}

async fn serve_post(
    State(inner): State<Arc<ServerInner>>,
    Query(query): Query<TransportQuery>,
    body: String,
) -> Response {
    if query.transport != "polling" {
        return error_response(SockeyeError::MethodNotAllowed);
    }
    let Some(sid) = query.sid else {
        return error_response(SockeyeError::ConnectionNotFound);
    };
    match inner.polling.serve_post(&sid, &body).await {
        Ok(()) => polling_response(&inner, "ok".to_string()),
        Err(e) => error_response(e),
    }
}

fn remote_addr(connect_info: &Option<ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .as_ref()
        .map(|ci| ci.0.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn polling_response(inner: &ServerInner, body: String) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    for (name, value) in &inner.polling.config().headers {
        if let (Ok(name), Ok(value)) = (name.parse::<header::HeaderName>(), value.parse()) {
            headers.insert(name, value);
        }
    }
    response
}

fn error_response(e: SockeyeError) -> Response {
    let status = match e {
        SockeyeError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        SockeyeError::UpgradeFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string()).into_response()
}
