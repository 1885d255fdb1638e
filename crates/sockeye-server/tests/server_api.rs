//! Public API surface tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;

use sockeye_core::SockeyeError;
use sockeye_server::{Channel, Server, ON_CONNECTION, ON_DISCONNECTION, ON_ERROR};

#[tokio::test]
async fn registration_accepts_every_handler_shape() {
    let server = Server::with_defaults();
    server.on("zero", |_c: Arc<Channel>| async {}).unwrap();
    server
        .on("one", |_c: Arc<Channel>, _v: serde_json::Value| async {})
        .unwrap();
    server.on_ack("ret0", |_c: Arc<Channel>| async { 42 }).unwrap();
    server
        .on_ack("ret1", |_c: Arc<Channel>, v: String| async move { v })
        .unwrap();
}

#[tokio::test]
async fn system_events_enforce_their_shape() {
    let server = Server::with_defaults();
    for name in [ON_CONNECTION, ON_DISCONNECTION, ON_ERROR] {
        server.on(name, |_c: Arc<Channel>| async {}).unwrap();
        let err = server
            .on(name, |_c: Arc<Channel>, _v: String| async {})
            .unwrap_err();
        assert!(matches!(err, SockeyeError::BadHandlerShape(_)), "{name}");
        let err = server
            .on_ack(name, |_c: Arc<Channel>| async { "no" })
            .unwrap_err();
        assert!(matches!(err, SockeyeError::BadHandlerShape(_)), "{name}");
    }
}

#[tokio::test]
async fn empty_server_counts() {
    let server = Server::with_defaults();
    assert_eq!(server.count_channels(), 0);
    assert_eq!(server.count_rooms(), 0);
    assert_eq!(server.amount("anything"), 0);
    assert!(server.list("anything").is_empty());
    assert!(matches!(
        server.get_channel("missing").unwrap_err(),
        SockeyeError::ConnectionNotFound
    ));
}

#[tokio::test]
async fn router_builds() {
    let server = Server::with_defaults();
    let _router = server.router();
}

#[tokio::test]
async fn broadcasts_to_empty_rooms_are_noops() {
    let server = Server::with_defaults();
    server.broadcast_to("ghost-room", "tick", &1);
    server.broadcast_to_all("tick", &1);
}
