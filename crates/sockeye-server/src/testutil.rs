//! Shared test fixtures: a scripted in-memory connection plus channel setup.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use tokio::sync::{mpsc, Notify};

use sockeye_core::protocol::OpenPayload;
use sockeye_core::{Result, SockeyeError};

use crate::channel::Channel;
use crate::server::Server;
use crate::transport::Connection;

const CLOSE_SENTINEL: &str = "\u{0}close";

/// Install a fmt subscriber (once) so `tracing` output from the code under
/// test shows up when `RUST_LOG` is set.
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// In-memory connection driven by the test: pushed strings become inbound
/// packets, written packets are recorded.
pub(crate) struct MockConnection {
    inbound_tx: mpsc::Sender<String>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    written: Mutex<Vec<String>>,
    wrote: Notify,
    ping_interval: Duration,
    ping_timeout: Duration,
}

impl MockConnection {
    pub(crate) fn pair(
        ping_interval: Duration,
        ping_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Sender<String>) {
        init_tracing();
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Self {
            inbound_tx: tx.clone(),
            inbound_rx: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            wrote: Notify::new(),
            ping_interval,
            ping_timeout,
        });
        (conn, tx)
    }

    pub(crate) fn written(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until a written packet matches `predicate`, returning it.
    pub(crate) async fn wait_written(&self, predicate: impl Fn(&str) -> bool) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(found) = self.written().into_iter().find(|m| predicate(m)) {
                return found;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected packet was never written; got {:?}",
                self.written()
            );
            tokio::select! {
                _ = self.wrote.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn get_message(&self) -> Result<String> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            None => Err(SockeyeError::ChannelClosed),
            Some(m) if m == CLOSE_SENTINEL => Err(SockeyeError::ChannelClosed),
            Some(m) => Ok(m),
        }
    }

    async fn write_message(&self, message: String) -> Result<()> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        self.wrote.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        let _ = self.inbound_tx.try_send(CLOSE_SENTINEL.to_string());
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.ping_interval, self.ping_timeout)
    }
}

/// Register a channel over a mock connection the way the server façade does
/// for a fresh session.
pub(crate) async fn attach_channel(
    server: &Server,
    sid: &str,
    conn: Arc<MockConnection>,
) -> Arc<Channel> {
    let (interval, timeout) = conn.ping_params();
    let payload = OpenPayload {
        sid: sid.to_string(),
        upgrades: Vec::new(),
        ping_interval: interval.as_millis() as u64,
        ping_timeout: timeout.as_millis() as u64,
    };
    let channel = Channel::new(
        conn,
        "127.0.0.1:9".to_string(),
        HeaderMap::new(),
        Arc::downgrade(&server.inner),
        payload,
        true,
        Duration::from_secs(1),
    );
    server.inner.sids.insert(sid.to_string(), channel.clone());
    channel.start();
    channel.fire_connection_once().await;
    channel
}

/// Poll `cond` until it holds, or fail the test after five seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
