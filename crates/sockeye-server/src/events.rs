//! Typed event handlers: registration and dispatch.
//!
//! Handlers are typed at registration (no runtime reflection): `on` accepts
//! arity 0 (channel only) or arity 1 (channel + one deserialized value)
//! through the marker-generic [`IntoEventHandler`] seam, and `on_ack` does
//! the same for handlers whose return value answers an ack request. The
//! argument of an arity-1 handler is decoded lazily from the raw JSON args
//! array the packet carried.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;

use sockeye_core::{Result, SockeyeError};

use crate::channel::Channel;

/// System event: fired once when a session opens.
pub const ON_CONNECTION: &str = "connection";
/// System event: fired once after a session's inbound loop exits.
pub const ON_DISCONNECTION: &str = "disconnection";
/// System event: fired when a channel hits an unrecoverable transport error.
pub const ON_ERROR: &str = "error";

fn is_system_event(name: &str) -> bool {
    matches!(name, ON_CONNECTION | ON_DISCONNECTION | ON_ERROR)
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type PlainFn = Box<dyn Fn(Arc<Channel>, String) -> BoxFuture<()> + Send + Sync>;
type AckFn = Box<dyn Fn(Arc<Channel>, String) -> BoxFuture<Option<String>> + Send + Sync>;

fn boxed<T, F>(future: F) -> BoxFuture<T>
where
    F: Future<Output = T> + Send + 'static,
{
    Box::pin(future)
}

/// A registered plain event handler.
pub struct EventHandler {
    arity: usize,
    run: PlainFn,
}

/// A registered handler whose return value answers an ack request.
pub struct AckHandler {
    run: AckFn,
}

/// Marker for handlers that take only the channel.
pub struct NoArgs;

/// Marker for handlers that take the channel plus one deserialized value.
pub struct OneArg<T>(PhantomData<T>);

/// Conversion seam for plain event handlers.
pub trait IntoEventHandler<Args>: Send + Sync + 'static {
    fn into_handler(self) -> EventHandler;
}

/// Conversion seam for ack-answering handlers.
pub trait IntoAckHandler<Args>: Send + Sync + 'static {
    fn into_handler(self) -> AckHandler;
}

impl<F, Fut> IntoEventHandler<NoArgs> for F
where
    F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_handler(self) -> EventHandler {
        EventHandler {
            arity: 0,
            run: Box::new(move |channel, _args| boxed(self(channel))),
        }
    }
}

impl<F, Fut, T> IntoEventHandler<OneArg<T>> for F
where
    F: Fn(Arc<Channel>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    fn into_handler(self) -> EventHandler {
        EventHandler {
            arity: 1,
            run: Box::new(move |channel, args| match decode_first::<T>(&args) {
                Ok(value) => boxed(self(channel, value)),
                Err(e) => {
                    tracing::warn!(%e, "dropping event with undecodable argument");
                    boxed(async {})
                }
            }),
        }
    }
}

impl<F, Fut, R> IntoAckHandler<NoArgs> for F
where
    F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn into_handler(self) -> AckHandler {
        AckHandler {
            run: Box::new(move |channel, _args| {
                let fut = self(channel);
                boxed(async move { encode_reply(fut.await) })
            }),
        }
    }
}

impl<F, Fut, T, R> IntoAckHandler<OneArg<T>> for F
where
    F: Fn(Arc<Channel>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn into_handler(self) -> AckHandler {
        AckHandler {
            run: Box::new(move |channel, args| match decode_first::<T>(&args) {
                Ok(value) => {
                    let fut = self(channel, value);
                    boxed(async move { encode_reply(fut.await) })
                }
                Err(e) => {
                    tracing::warn!(%e, "dropping ack request with undecodable argument");
                    boxed(async { None })
                }
            }),
        }
    }
}

/// Deserialize the first element of the raw JSON args array.
fn decode_first<T: DeserializeOwned>(args: &str) -> Result<T> {
    let elems: Vec<&RawValue> = serde_json::from_str(args)
        .map_err(|e| SockeyeError::MalformedPacket(format!("argument array: {e}")))?;
    let first = elems
        .first()
        .ok_or_else(|| SockeyeError::MalformedPacket("missing event argument".into()))?;
    serde_json::from_str(first.get())
        .map_err(|e| SockeyeError::MalformedPacket(format!("event argument: {e}")))
}

/// Serialize a handler return value into ack response args (`[<value>]`).
fn encode_reply<R: Serialize>(value: R) -> Option<String> {
    match serde_json::to_string(&(value,)) {
        Ok(array) => Some(array),
        Err(e) => {
            tracing::warn!(%e, "ack reply serialization failed");
            None
        }
    }
}

enum Registered {
    Plain(PlainFn),
    Acking(AckFn),
}

/// Name → handler map. Lookups clone the handler out so no map guard is
/// held while the handler runs.
#[derive(Default)]
pub(crate) struct EventRegistry {
    handlers: DashMap<String, Arc<Registered>>,
}

impl EventRegistry {
    pub(crate) fn on<A>(&self, name: &str, handler: impl IntoEventHandler<A>) -> Result<()> {
        let handler = handler.into_handler();
        if is_system_event(name) && handler.arity != 0 {
            return Err(SockeyeError::BadHandlerShape(format!(
                "system event {name:?} handlers take only the channel"
            )));
        }
        self.handlers
            .insert(name.to_string(), Arc::new(Registered::Plain(handler.run)));
        Ok(())
    }

    pub(crate) fn on_ack<A>(&self, name: &str, handler: impl IntoAckHandler<A>) -> Result<()> {
        if is_system_event(name) {
            return Err(SockeyeError::BadHandlerShape(format!(
                "system event {name:?} cannot answer acks"
            )));
        }
        let handler = handler.into_handler();
        self.handlers
            .insert(name.to_string(), Arc::new(Registered::Acking(handler.run)));
        Ok(())
    }

    /// Invoke the handler for a plain event. Unknown events are dropped and
    /// any return value is discarded. Panics are contained to this dispatch.
    pub(crate) async fn dispatch(&self, name: &str, channel: Arc<Channel>, args: String) {
        let Some(handler) = self.find(name) else {
            tracing::debug!(event = name, "no handler registered");
            return;
        };
        let fut: BoxFuture<()> = match handler.as_ref() {
            Registered::Plain(run) => run(channel, args),
            Registered::Acking(run) => {
                let fut = run(channel, args);
                boxed(async move {
                    let _ = fut.await;
                })
            }
        };
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            tracing::error!(event = name, "handler panicked; dispatch aborted");
        }
    }

    /// Invoke the handler for an ack request. `Some` carries the serialized
    /// response args; handlers without a declared return yield `None` and
    /// the request is silently ignored.
    pub(crate) async fn dispatch_ack(
        &self,
        name: &str,
        channel: Arc<Channel>,
        args: String,
    ) -> Option<String> {
        let handler = self.find(name)?;
        match handler.as_ref() {
            Registered::Plain(run) => {
                let fut = run(channel, args);
                if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    tracing::error!(event = name, "handler panicked; dispatch aborted");
                }
                None
            }
            Registered::Acking(run) => {
                let fut = run(channel, args);
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(reply) => reply,
                    Err(_) => {
                        tracing::error!(event = name, "handler panicked; ack dropped");
                        None
                    }
                }
            }
        }
    }

    /// Fire a system event (`connection`, `disconnection`, `error`).
    pub(crate) async fn fire_system(&self, name: &str, channel: Arc<Channel>) {
        self.dispatch(name, channel, "[]".to_string()).await;
    }

    fn find(&self, name: &str) -> Option<Arc<Registered>> {
        self.handlers.get(name).map(|e| e.value().clone())
    }
}
