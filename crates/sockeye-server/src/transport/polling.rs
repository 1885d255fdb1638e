//! XHR long-polling transport.
//!
//! Duplex is emulated over HTTP: each `GET ?sid=…` parks in the polling
//! writer until a frame is ready (or the send window lapses), each
//! `POST ?sid=…` feeds decoded packets into the inbound rendezvous. The
//! transport owns the `sid → connection` session map.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use sockeye_core::protocol::{decode_frames, with_length, OpenPayload, Packet};
use sockeye_core::{Result, SockeyeError};

use crate::config::PollingConfig;
use crate::transport::{Connection, STOP_MESSAGE, UPGRADED_MESSAGE};

/// Outcome the polling writer reports back to a pending `write_message`.
#[derive(Debug)]
enum WriteStatus {
    Ok,
    Err(String),
}

type Sessions = DashMap<String, Arc<PollingConnection>>;

pub struct PollingTransport {
    config: PollingConfig,
    sessions: Arc<Sessions>,
}

impl PollingTransport {
    pub fn new(config: PollingConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Dial a server: run the open-sequence handshake and return a
    /// connection bound to the session.
    pub async fn connect(&self, url: &str) -> Result<Arc<PollingClientConnection>> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (name, value) in &self.config.headers {
            let name: reqwest::header::HeaderName = name
                .parse()
                .map_err(|_| SockeyeError::BadConfig(format!("bad header name {name:?}")))?;
            let value = value
                .parse()
                .map_err(|_| SockeyeError::BadConfig(format!("bad header value for {name}")))?;
            default_headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| SockeyeError::TransportIo(e.to_string()))?;

        let body = get_text(&client, url, self.config.receive_timeout()).await?;
        let mut frames = decode_frames(&body)?.into_iter();
        let first = frames.next().ok_or_else(|| {
            SockeyeError::UpgradeFailed("handshake response carried no frames".into())
        })?;
        let Packet::Open(raw) = Packet::decode(&first)? else {
            return Err(SockeyeError::UpgradeFailed(
                "handshake did not start with an open packet".into(),
            ));
        };
        let payload = OpenPayload::from_json(&raw)?;
        let session_url = format!("{url}&sid={}", payload.sid);
        tracing::debug!(sid = %payload.sid, "polling client handshake accepted");

        // The empty sentinel either rides in the handshake body or arrives
        // on the next poll.
        let noop = Packet::Noop.encode();
        match frames.next() {
            Some(frame) if frame == noop => {}
            Some(other) => {
                return Err(SockeyeError::UpgradeFailed(format!(
                    "unexpected handshake frame {other:?}"
                )))
            }
            None => {
                let body = get_text(&client, &session_url, self.config.receive_timeout()).await?;
                if decode_frames(&body)?.first() != Some(&noop) {
                    return Err(SockeyeError::UpgradeFailed(
                        "open sequence missing the empty sentinel".into(),
                    ));
                }
            }
        }

        Ok(Arc::new(PollingClientConnection {
            client,
            url: session_url,
            pending: Mutex::new(VecDeque::new()),
            config: self.config.clone(),
        }))
    }

    /// Build a fresh connection for a handshake request.
    pub(crate) fn handle_connection(&self) -> Arc<PollingConnection> {
        // Capacity-1 channels give rendezvous-style handoff between the
        // HTTP handlers and the channel loops.
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = mpsc::channel(1);
        Arc::new(PollingConnection {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            status_tx,
            status_rx: Mutex::new(status_rx),
            sid: OnceLock::new(),
            sessions: Arc::downgrade(&self.sessions),
            config: self.config.clone(),
        })
    }

    /// Register the connection under its session id.
    pub(crate) fn set_sid(&self, sid: &str, conn: &Arc<PollingConnection>) {
        tracing::debug!(%sid, "registering polling session");
        let _ = conn.sid.set(sid.to_string());
        self.sessions.insert(sid.to_string(), conn.clone());
    }

    pub(crate) fn get(&self, sid: &str) -> Option<Arc<PollingConnection>> {
        self.sessions.get(sid).map(|e| e.value().clone())
    }

    /// Serve a follow-up GET: park until a frame (or nothing) is ready.
    pub(crate) async fn serve_get(&self, sid: &str) -> Result<String> {
        let conn = self.get(sid).ok_or(SockeyeError::ConnectionNotFound)?;
        Ok(conn.polling_writer().await)
    }

    /// Serve a POST: decode the framed body into the inbound rendezvous.
    pub(crate) async fn serve_post(&self, sid: &str, body: &str) -> Result<()> {
        let conn = self.get(sid).ok_or(SockeyeError::ConnectionNotFound)?;
        conn.intake(body).await
    }
}

/// One long-polling session endpoint.
pub struct PollingConnection {
    inbound_tx: mpsc::Sender<String>,
    inbound_rx: Mutex<mpsc::Receiver<String>>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Mutex<mpsc::Receiver<String>>,
    status_tx: mpsc::Sender<WriteStatus>,
    status_rx: Mutex<mpsc::Receiver<WriteStatus>>,
    sid: OnceLock<String>,
    sessions: Weak<Sessions>,
    config: PollingConfig,
}

impl PollingConnection {
    /// Park for the next outbound frame and produce the HTTP body for the
    /// in-flight GET. A send-window lapse yields an empty body.
    ///
    /// A writer that picks up the `Noop` retirement sentinel completes the
    /// GET normally and then releases the parked reader with the stop
    /// control message.
    pub(crate) async fn polling_writer(&self) -> String {
        let mut rx = self.outbound_rx.lock().await;
        match timeout(self.config.send_timeout(), rx.recv()).await {
            Err(_) | Ok(None) => String::new(),
            Ok(Some(message)) => {
                let body = with_length(&message);
                let _ = self.status_tx.try_send(WriteStatus::Ok);
                if message == Packet::Noop.encode() {
                    tracing::debug!(sid = ?self.sid.get(), "polling writer delivering retirement noop");
                    let _ = self.inbound_tx.try_send(STOP_MESSAGE.to_string());
                }
                body
            }
        }
    }

    /// Push every packet of a POST body into the inbound rendezvous and
    /// acknowledge with `ok`. Bounded by the receive window so a dead
    /// reader cannot wedge the HTTP request.
    pub(crate) async fn intake(&self, body: &str) -> Result<()> {
        for packet in decode_frames(body)? {
            self.inbound_tx
                .send_timeout(packet, self.config.receive_timeout())
                .await
                .map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => SockeyeError::ReadTimeout,
                    mpsc::error::SendTimeoutError::Closed(_) => SockeyeError::ChannelClosed,
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PollingConnection {
    async fn get_message(&self) -> Result<String> {
        let mut rx = self.inbound_rx.lock().await;
        match timeout(self.config.receive_timeout(), rx.recv()).await {
            Err(_) => Err(SockeyeError::ReadTimeout),
            Ok(None) => Err(SockeyeError::ChannelClosed),
            Ok(Some(m)) if m == STOP_MESSAGE || m == UPGRADED_MESSAGE => {
                Err(SockeyeError::ChannelClosed)
            }
            Ok(Some(m)) => Ok(m),
        }
    }

    async fn write_message(&self, message: String) -> Result<()> {
        // Discard any stale status left by a writer whose waiter timed out.
        {
            let mut status = self.status_rx.lock().await;
            while status.try_recv().is_ok() {}
        }

        self.outbound_tx
            .send_timeout(message, self.config.send_timeout())
            .await
            .map_err(|_| SockeyeError::WriteTimeout)?;

        let mut status = self.status_rx.lock().await;
        match timeout(self.config.send_timeout(), status.recv()).await {
            Err(_) => Err(SockeyeError::WriteTimeout),
            Ok(None) => Err(SockeyeError::ChannelClosed),
            Ok(Some(WriteStatus::Ok)) => Ok(()),
            Ok(Some(WriteStatus::Err(e))) => Err(SockeyeError::TransportIo(e)),
        }
    }

    async fn close(&self) {
        // Release a parked writer (which will in turn release the reader)
        // and, in case none is parked, the reader directly.
        let _ = self.outbound_tx.try_send(Packet::Noop.encode());
        let _ = self.inbound_tx.try_send(STOP_MESSAGE.to_string());
        if let (Some(sessions), Some(sid)) = (self.sessions.upgrade(), self.sid.get()) {
            sessions.remove(sid);
        }
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.config.ping_interval(), self.config.ping_timeout())
    }
}

/// Client-side polling connection obtained from
/// [`PollingTransport::connect`]: duplex over paired GET (read) and POST
/// (write) requests against the session URL.
pub struct PollingClientConnection {
    client: reqwest::Client,
    url: String,
    /// Frames received beyond the first of a poll body, served before the
    /// next GET is issued.
    pending: Mutex<VecDeque<String>>,
    config: PollingConfig,
}

#[async_trait]
impl Connection for PollingClientConnection {
    async fn get_message(&self) -> Result<String> {
        if let Some(buffered) = self.pending.lock().await.pop_front() {
            return Ok(buffered);
        }
        timeout(self.config.receive_timeout(), async {
            loop {
                let body = get_text(&self.client, &self.url, self.config.receive_timeout()).await?;
                // An empty body is a lapsed poll window; ask again.
                if body.is_empty() {
                    continue;
                }
                let mut frames = decode_frames(&body)?.into_iter();
                let Some(first) = frames.next() else {
                    continue;
                };
                self.pending.lock().await.extend(frames);
                return Ok(first);
            }
        })
        .await
        .map_err(|_| SockeyeError::ReadTimeout)?
    }

    async fn write_message(&self, message: String) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.config.send_timeout())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(with_length(&message))
            .send()
            .await
            .map_err(|e| SockeyeError::TransportIo(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| SockeyeError::TransportIo(e.to_string()))?;
        if body != "ok" {
            return Err(SockeyeError::TransportIo(format!(
                "unexpected POST response {body:?}"
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        let _ = self.write_message(Packet::Close.encode()).await;
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.config.ping_interval(), self.config.ping_timeout())
    }
}

async fn get_text(client: &reqwest::Client, url: &str, deadline: Duration) -> Result<String> {
    let response = client
        .get(url)
        .timeout(deadline)
        .send()
        .await
        .map_err(|e| SockeyeError::TransportIo(e.to_string()))?;
    response
        .text()
        .await
        .map_err(|e| SockeyeError::TransportIo(e.to_string()))
}
