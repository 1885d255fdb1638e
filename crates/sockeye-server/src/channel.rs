//! Per-client channel: session state, inbound/outbound loops, liveness and
//! the polling → websocket upgrade handoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use axum::http::HeaderMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval_at, timeout, Instant};

use sockeye_core::protocol::{OpenPayload, Packet};
use sockeye_core::{Result, SockeyeError};

use crate::ack::{AckOutcome, AckTable};
use crate::events::{ON_CONNECTION, ON_DISCONNECTION, ON_ERROR};
use crate::server::ServerInner;
use crate::transport::Connection;

const OUT_QUEUE_CAPACITY: usize = 1024;

/// A durable per-client session, possibly spanning multiple transports via
/// upgrade. Owned by the server through the sid index; holds a non-owning
/// handle back to the server for fan-out APIs.
pub struct Channel {
    sid: String,
    remote_addr: String,
    headers: HeaderMap,
    open_payload: OpenPayload,
    conn: Arc<dyn Connection>,
    server: Weak<ServerInner>,

    out_tx: mpsc::Sender<String>,
    out_rx: Mutex<Option<mpsc::Receiver<String>>>,

    alive: watch::Sender<bool>,
    started: AtomicBool,
    stubbed: AtomicBool,
    torn_down: AtomicBool,
    connection_fired: AtomicBool,
    upgraded: AtomicBool,
    probe_seen: Notify,

    acks: AckTable,
    last_seen: Mutex<Instant>,

    ping_interval: Duration,
    ping_timeout: Duration,
    send_timeout: Duration,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("sid", &self.sid).finish()
    }
}

impl Channel {
    pub(crate) fn new(
        conn: Arc<dyn Connection>,
        remote_addr: String,
        headers: HeaderMap,
        server: Weak<ServerInner>,
        open_payload: OpenPayload,
        fresh: bool,
        send_timeout: Duration,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        let (alive, _) = watch::channel(true);
        let (ping_interval, ping_timeout) = conn.ping_params();
        Arc::new(Self {
            sid: open_payload.sid.clone(),
            remote_addr,
            headers,
            open_payload,
            conn,
            server,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            alive,
            started: AtomicBool::new(false),
            stubbed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            // Upgrade replacements silently re-enter the sid index; only
            // fresh sessions fire the user `connection` handler.
            connection_fired: AtomicBool::new(!fresh),
            upgraded: AtomicBool::new(false),
            probe_seen: Notify::new(),
            acks: AckTable::default(),
            last_seen: Mutex::new(Instant::now()),
            ping_interval,
            ping_timeout,
            send_timeout,
        })
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.sid
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Headers snapshot taken from the request that created the session.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Send an event to this client.
    pub async fn emit<T: Serialize + ?Sized>(&self, name: &str, payload: &T) -> Result<()> {
        let packet = Packet::Event {
            name: name.to_string(),
            args: encode_args(payload)?,
        };
        self.enqueue(packet.encode()).await
    }

    /// Send an event that requires a response, and wait for it up to `wait`.
    /// Returns the raw JSON args array of the response; deserialization is
    /// the caller's business.
    pub async fn ack<T: Serialize + ?Sized>(
        &self,
        name: &str,
        payload: &T,
        wait: Duration,
    ) -> Result<String> {
        let (ack_id, rx) = self.acks.register();
        let packet = Packet::AckRequest {
            name: name.to_string(),
            args: encode_args(payload)?,
            ack_id,
        };
        if let Err(e) = self.enqueue(packet.encode()).await {
            self.acks.remove(ack_id);
            return Err(e);
        }
        match timeout(wait, rx).await {
            Err(_) => {
                self.acks.remove(ack_id);
                Err(SockeyeError::AckTimeout)
            }
            Ok(Err(_)) => {
                self.acks.remove(ack_id);
                Err(SockeyeError::ChannelClosed)
            }
            Ok(Ok(AckOutcome::Success(raw))) => Ok(raw),
            Ok(Ok(AckOutcome::Closed)) => Err(SockeyeError::ChannelClosed),
        }
    }

    pub fn join(self: &Arc<Self>, room: &str) -> Result<()> {
        if !self.is_alive() {
            return Err(SockeyeError::ChannelClosed);
        }
        self.server()?.rooms.join(room, self);
        Ok(())
    }

    pub fn leave(&self, room: &str) -> Result<()> {
        self.server()?.rooms.leave(room, &self.sid);
        Ok(())
    }

    /// Fan an event out to every other member of the room. Per-recipient
    /// failures are absorbed; the sender is excluded.
    pub fn broadcast_to<T: Serialize + ?Sized>(&self, room: &str, name: &str, payload: &T) {
        if let Ok(server) = self.server() {
            server.broadcast(room, name, payload, Some(&self.sid));
        }
    }

    /// Shut the channel down. Double-close is a no-op.
    pub async fn close(&self) {
        self.begin_close().await;
    }

    fn server(&self) -> Result<Arc<ServerInner>> {
        self.server.upgrade().ok_or(SockeyeError::ChannelClosed)
    }

    pub(crate) fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    pub(crate) fn is_stubbed(&self) -> bool {
        self.stubbed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::SeqCst)
    }

    /// Push an already-encoded packet onto the outbound queue. Blocks up to
    /// the send window when the queue is full.
    pub(crate) async fn enqueue(&self, message: String) -> Result<()> {
        if !self.is_alive() {
            return Err(SockeyeError::ChannelClosed);
        }
        self.out_tx
            .send_timeout(message, self.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => SockeyeError::WriteTimeout,
                mpsc::error::SendTimeoutError::Closed(_) => SockeyeError::ChannelClosed,
            })
    }

    /// Enqueue the open packet and the empty sentinel that start every
    /// session.
    pub(crate) async fn send_open_sequence(&self) -> Result<()> {
        let open = Packet::Open(self.open_payload.to_json()?);
        self.enqueue(open.encode()).await?;
        self.enqueue(Packet::Noop.encode()).await
    }

    pub(crate) fn open_payload(&self) -> &OpenPayload {
        &self.open_payload
    }

    /// Fire the `connection` system event, at most once per session.
    pub(crate) async fn fire_connection_once(self: &Arc<Self>) {
        if self.connection_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(server) = self.server.upgrade() {
            server.events.fire_system(ON_CONNECTION, self.clone()).await;
        }
    }

    /// Resolve once the upgrade probe ping has been observed.
    pub(crate) async fn wait_upgraded(&self) {
        self.probe_seen.notified().await;
    }

    /// Retire a polling channel that was replaced by a websocket upgrade:
    /// no `disconnection`, no registry cleanup, just release its loops and
    /// fail whatever was still pending.
    pub(crate) async fn stub(&self) {
        if self.stubbed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(sid = %self.sid, "stubbing retired polling channel");
        let _ = self.alive.send(false);
        self.conn.close().await;
        self.acks.fail_all();
    }

    /// Spawn the inbound and outbound tasks. Idempotent.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(rx) = self.lock_out_rx().take() else {
            return;
        };

        let channel = self.clone();
        tokio::spawn(async move { channel.out_loop(rx).await });

        let channel = self.clone();
        tokio::spawn(async move {
            channel.in_loop().await;
            channel.teardown().await;
        });
    }

    async fn in_loop(self: &Arc<Self>) {
        loop {
            let message = match self.conn.get_message().await {
                Ok(m) => m,
                Err(e) => {
                    if self.is_alive() && !self.is_stubbed() {
                        tracing::debug!(sid = %self.sid, %e, "inbound loop ending");
                    }
                    break;
                }
            };
            *self.lock_last_seen() = Instant::now();

            let packet = match Packet::decode(&message) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(sid = %self.sid, %e, "dropping malformed inbound packet");
                    continue;
                }
            };
            if self.process(packet).await.is_err() {
                break;
            }
        }
    }

    async fn process(self: &Arc<Self>, packet: Packet) -> Result<()> {
        match packet {
            Packet::Ping(payload) => {
                // The first websocket ping doubles as the upgrade probe.
                self.probe_seen.notify_one();
                self.enqueue(Packet::Pong(payload).encode()).await?;
            }
            Packet::Pong(_) => {}
            Packet::Connect => {
                self.enqueue(Packet::Connect.encode()).await?;
                self.fire_connection_once().await;
            }
            Packet::Event { name, args } => {
                self.server()?.events.dispatch(&name, self.clone(), args).await;
            }
            Packet::AckRequest { name, args, ack_id } => {
                let server = self.server()?;
                if let Some(reply) = server.events.dispatch_ack(&name, self.clone(), args).await {
                    let response = Packet::AckResponse {
                        ack_id,
                        args: reply,
                    };
                    self.enqueue(response.encode()).await?;
                }
            }
            Packet::AckResponse { ack_id, args } => self.acks.resolve(ack_id, args),
            Packet::Upgrade => self.mark_upgraded(),
            Packet::Close => return Err(SockeyeError::ChannelClosed),
            Packet::Open(_) | Packet::Disconnect | Packet::Noop => {}
        }
        Ok(())
    }

    async fn out_loop(self: &Arc<Self>, mut rx: mpsc::Receiver<String>) {
        let mut alive = self.alive.subscribe();
        let start = Instant::now();
        let mut ping = interval_at(start + self.ping_interval, self.ping_interval);
        let check = (self.ping_timeout / 4).clamp(Duration::from_millis(25), Duration::from_secs(1));
        let mut liveness = interval_at(start + check, check);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(message) => {
                        if let Err(e) = self.conn.write_message(message).await {
                            tracing::warn!(sid = %self.sid, %e, "outbound write failed");
                            self.fire_error().await;
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    let ping_packet = Packet::Ping(String::new()).encode();
                    if self.conn.write_message(ping_packet).await.is_err() {
                        break;
                    }
                }
                _ = liveness.tick() => {
                    if self.lock_last_seen().elapsed() >= self.ping_timeout {
                        tracing::info!(sid = %self.sid, "ping timeout, closing channel");
                        break;
                    }
                }
                _ = alive.changed() => {
                    if !*alive.borrow() {
                        break;
                    }
                }
            }
        }

        // Discard whatever is still queued, then make sure the inbound side
        // wakes up and runs the teardown.
        rx.close();
        while rx.try_recv().is_ok() {}
        self.begin_close().await;
    }

    async fn begin_close(&self) {
        if self.alive.send_replace(false) {
            self.conn.close().await;
        }
    }

    /// Runs exactly once, after the inbound loop has exited. `disconnection`
    /// fires before registry cleanup; stubbed channels skip both.
    async fn teardown(self: &Arc<Self>) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.begin_close().await;
        if !self.is_stubbed() {
            if let Some(server) = self.server.upgrade() {
                server.events.fire_system(ON_DISCONNECTION, self.clone()).await;
                server.unregister(self);
            }
        }
        self.acks.fail_all();
    }

    async fn fire_error(self: &Arc<Self>) {
        if let Some(server) = self.server.upgrade() {
            server.events.fire_system(ON_ERROR, self.clone()).await;
        }
    }

    fn lock_last_seen(&self) -> MutexGuard<'_, Instant> {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_out_rx(&self) -> MutexGuard<'_, Option<mpsc::Receiver<String>>> {
        self.out_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wrap a payload into a one-element JSON args array.
pub(crate) fn encode_args<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    serde_json::to_string(&(payload,)).map_err(|e| SockeyeError::MalformedPacket(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::server::Server;
    use crate::testutil::{attach_channel, wait_until, MockConnection};

    fn mock() -> (Arc<MockConnection>, mpsc::Sender<String>) {
        MockConnection::pair(Duration::from_secs(30), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn connect_is_echoed_and_connection_fires_once() {
        let server = Server::with_defaults();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            server
                .on(ON_CONNECTION, move |_c: Arc<Channel>| {
                    let fired = fired.clone();
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }

        let (conn, tx) = mock();
        let channel = attach_channel(&server, "s1", conn.clone()).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tx.send("40".to_string()).await.unwrap();
        conn.wait_written(|m| m == "40").await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn typed_event_dispatch() {
        #[derive(Deserialize)]
        struct Data {
            x: i64,
        }

        let server = Server::with_defaults();
        let seen = Arc::new(AtomicI64::new(0));
        {
            let seen = seen.clone();
            server
                .on("send", move |_c: Arc<Channel>, data: Data| {
                    let seen = seen.clone();
                    async move {
                        seen.store(data.x, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }

        let (conn, tx) = mock();
        let _channel = attach_channel(&server, "s2", conn).await;
        tx.send(r#"42["send",{"x":1}]"#.to_string()).await.unwrap();
        wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn ack_request_is_answered_with_matching_id() {
        let server = Server::with_defaults();
        server
            .on_ack("join", |c: Arc<Channel>, room: String| async move {
                c.join(&room).ok();
                "OK"
            })
            .unwrap();

        let (conn, tx) = mock();
        let _channel = attach_channel(&server, "s3", conn.clone()).await;
        tx.send(r#"421["join","roomA"]"#.to_string()).await.unwrap();

        let reply = conn.wait_written(|m| m.starts_with("43")).await;
        assert_eq!(reply, r#"431["OK"]"#);
        assert_eq!(server.amount("roomA"), 1);
    }

    #[tokio::test]
    async fn ack_request_without_return_handler_is_ignored() {
        let server = Server::with_defaults();
        server.on("fire", |_c: Arc<Channel>| async {}).unwrap();

        let (conn, tx) = mock();
        let _channel = attach_channel(&server, "s4", conn.clone()).await;
        tx.send(r#"425["fire"]"#.to_string()).await.unwrap();
        tx.send("2probe".to_string()).await.unwrap();

        // The pong proves the loop got past the ack request without replying.
        conn.wait_written(|m| m == "3probe").await;
        assert!(!conn.written().iter().any(|m| m.starts_with("43")));
    }

    #[tokio::test]
    async fn outbound_ack_correlation() {
        let server = Server::with_defaults();
        let (conn, tx) = mock();
        let channel = attach_channel(&server, "s5", conn.clone()).await;

        let waiter = tokio::spawn({
            let channel = channel.clone();
            async move { channel.ack("poke", &1, Duration::from_secs(2)).await }
        });

        let request = conn.wait_written(|m| m.starts_with("421")).await;
        assert_eq!(request, r#"421["poke",1]"#);

        tx.send(r#"431["pong"]"#.to_string()).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), r#"["pong"]"#);
    }

    #[tokio::test]
    async fn ack_times_out() {
        let server = Server::with_defaults();
        let (conn, _tx) = mock();
        let channel = attach_channel(&server, "s6", conn).await;

        let err = channel
            .ack("poke", &1, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SockeyeError::AckTimeout));
    }

    #[tokio::test]
    async fn close_fails_pending_acks_and_cleans_registries() {
        let server = Server::with_defaults();
        let disconnected = Arc::new(AtomicUsize::new(0));
        {
            let disconnected = disconnected.clone();
            server
                .on(ON_DISCONNECTION, move |_c: Arc<Channel>| {
                    let disconnected = disconnected.clone();
                    async move {
                        disconnected.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }

        let (conn, _tx) = mock();
        let channel = attach_channel(&server, "s7", conn.clone()).await;
        channel.join("roomX").unwrap();
        assert_eq!(server.amount("roomX"), 1);

        let waiter = tokio::spawn({
            let channel = channel.clone();
            async move { channel.ack("poke", &1, Duration::from_secs(5)).await }
        });
        conn.wait_written(|m| m.starts_with("421")).await;

        channel.close().await;
        assert!(matches!(
            waiter.await.unwrap().unwrap_err(),
            SockeyeError::ChannelClosed
        ));
        wait_until(|| server.count_channels() == 0).await;
        wait_until(|| disconnected.load(Ordering::SeqCst) == 1).await;
        assert_eq!(server.amount("roomX"), 0);
        assert_eq!(server.count_rooms(), 0);
        assert!(!channel.is_alive());

        // double close is a no-op
        channel.close().await;
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ping_timeout_disconnects() {
        let server = Server::with_defaults();
        let disconnected = Arc::new(AtomicUsize::new(0));
        {
            let disconnected = disconnected.clone();
            server
                .on(ON_DISCONNECTION, move |_c: Arc<Channel>| {
                    let disconnected = disconnected.clone();
                    async move {
                        disconnected.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }

        let (conn, _tx) =
            MockConnection::pair(Duration::from_millis(100), Duration::from_millis(300));
        let channel = attach_channel(&server, "s8", conn).await;
        channel.join("roomY").unwrap();

        wait_until(|| disconnected.load(Ordering::SeqCst) == 1).await;
        wait_until(|| server.count_channels() == 0).await;
        assert_eq!(server.amount("roomY"), 0);
        assert!(!channel.is_alive());
    }

    #[tokio::test]
    async fn malformed_packets_and_handler_panics_do_not_kill_the_channel() {
        let server = Server::with_defaults();
        server
            .on("boom", |_c: Arc<Channel>| async {
                panic!("kaboom");
            })
            .unwrap();
        let survived = Arc::new(AtomicBool::new(false));
        {
            let survived = survived.clone();
            server
                .on("after", move |_c: Arc<Channel>| {
                    let survived = survived.clone();
                    async move {
                        survived.store(true, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }

        let (conn, tx) = mock();
        let channel = attach_channel(&server, "s9", conn).await;

        tx.send("garbage".to_string()).await.unwrap();
        tx.send(r#"42["boom"]"#.to_string()).await.unwrap();
        tx.send(r#"42["unknown-event"]"#.to_string()).await.unwrap();
        tx.send(r#"42["after"]"#.to_string()).await.unwrap();

        wait_until(|| survived.load(Ordering::SeqCst)).await;
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn emit_reaches_the_transport_in_order() {
        let server = Server::with_defaults();
        let (conn, _tx) = mock();
        let channel = attach_channel(&server, "s10", conn.clone()).await;

        channel.emit("first", &1).await.unwrap();
        channel.emit("second", &2).await.unwrap();

        conn.wait_written(|m| m == r#"42["second",2]"#).await;
        let written = conn.written();
        let first = written.iter().position(|m| m == r#"42["first",1]"#);
        let second = written.iter().position(|m| m == r#"42["second",2]"#);
        assert!(first.unwrap() < second.unwrap());
    }
}
