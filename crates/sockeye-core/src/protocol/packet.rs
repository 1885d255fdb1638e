//! Packet grammar (text wire format).
//!
//! A packet is `<typeDigit><payload>`. Type digits: `0` open, `1` close,
//! `2` ping, `3` pong, `4` message, `5` upgrade, `6` noop. Message packets
//! carry a second digit: `0` connect, `1` disconnect, `2` event, `3` ack,
//! `4` error. Event and ack payloads are `[<ackID>]<JSON array>` with the
//! ackID present when a response is required.
//!
//! Parsing rules:
//! - Never index into the input without a bounds/boundary check.
//! - Never `unwrap()` / `expect()` / `panic!()` in production paths.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Result, SockeyeError};

/// Handshake payload carried by the `Open` packet.
///
/// Field names are part of the wire contract; ping values are integer
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPayload {
    pub sid: String,
    pub upgrades: Vec<String>,
    #[serde(rename = "pingInterval")]
    pub ping_interval: u64,
    #[serde(rename = "pingTimeout")]
    pub ping_timeout: u64,
}

impl OpenPayload {
    /// Serialize into the raw JSON carried by an `Open` packet.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SockeyeError::MalformedPacket(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SockeyeError::MalformedPacket(e.to_string()))
    }
}

/// Decoded wire packet.
///
/// `args` fields hold the raw text of a JSON array (the event arguments,
/// without the event name). Keeping them as text lets dispatch deserialize
/// lazily into whatever type the handler declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `0{json}` — handshake, payload is the raw `OpenPayload` JSON.
    Open(String),
    /// `1` — close notice.
    Close,
    /// `2<text>` — liveness probe, payload echoed back in the pong.
    Ping(String),
    /// `3<text>` — liveness reply.
    Pong(String),
    /// `40` — message-layer connect.
    Connect,
    /// `41` — message-layer disconnect.
    Disconnect,
    /// `42["name",…]` — event without ack.
    Event { name: String, args: String },
    /// `42<id>["name",…]` — event that requires an ack response.
    AckRequest {
        name: String,
        args: String,
        ack_id: u64,
    },
    /// `43<id>[…]` — response to a previously issued ack request.
    AckResponse { ack_id: u64, args: String },
    /// `5` — transport upgrade notice.
    Upgrade,
    /// `6` — noop / empty sentinel.
    Noop,
}

impl Packet {
    /// Encode into wire text. Total over the variant.
    pub fn encode(&self) -> String {
        match self {
            Packet::Open(payload) => format!("0{payload}"),
            Packet::Close => "1".to_string(),
            Packet::Ping(p) => format!("2{p}"),
            Packet::Pong(p) => format!("3{p}"),
            Packet::Connect => "40".to_string(),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { name, args } => format!("42{}", event_array(name, args)),
            Packet::AckRequest { name, args, ack_id } => {
                format!("42{ack_id}{}", event_array(name, args))
            }
            Packet::AckResponse { ack_id, args } => format!("43{ack_id}{args}"),
            Packet::Upgrade => "5".to_string(),
            Packet::Noop => "6".to_string(),
        }
    }

    /// Decode wire text into a packet.
    pub fn decode(text: &str) -> Result<Packet> {
        let type_digit = text
            .chars()
            .next()
            .ok_or_else(|| SockeyeError::MalformedPacket("empty packet".into()))?;
        let rest = &text[type_digit.len_utf8()..];

        match type_digit {
            '0' => Ok(Packet::Open(rest.to_string())),
            '1' => bare(Packet::Close, rest),
            '2' => Ok(Packet::Ping(rest.to_string())),
            '3' => Ok(Packet::Pong(rest.to_string())),
            '4' => decode_message(rest),
            '5' => bare(Packet::Upgrade, rest),
            '6' => bare(Packet::Noop, rest),
            other => Err(SockeyeError::MalformedPacket(format!(
                "unknown packet type {other:?}"
            ))),
        }
    }
}

/// Reject payload on packets that carry none.
fn bare(packet: Packet, rest: &str) -> Result<Packet> {
    if rest.is_empty() {
        Ok(packet)
    } else {
        Err(SockeyeError::MalformedPacket(format!(
            "unexpected payload on {:?}",
            packet.encode()
        )))
    }
}

/// Decode the message layer (`4…`).
fn decode_message(body: &str) -> Result<Packet> {
    let sub = body
        .chars()
        .next()
        .ok_or_else(|| SockeyeError::MalformedPacket("missing message sub-type".into()))?;
    let rest = &body[sub.len_utf8()..];

    match sub {
        '0' => bare(Packet::Connect, rest),
        '1' => bare(Packet::Disconnect, rest),
        '2' => {
            let (ack_id, array) = split_ack_prefix(rest)?;
            let (name, args) = split_event_array(array)?;
            Ok(match ack_id {
                Some(ack_id) => Packet::AckRequest { name, args, ack_id },
                None => Packet::Event { name, args },
            })
        }
        '3' => {
            let (ack_id, array) = split_ack_prefix(rest)?;
            let ack_id = ack_id.ok_or_else(|| {
                SockeyeError::MalformedPacket("ack response without ackID".into())
            })?;
            let args = rebuild_array(&parse_array(array)?);
            Ok(Packet::AckResponse { ack_id, args })
        }
        other => Err(SockeyeError::MalformedPacket(format!(
            "unhandled message sub-type {other:?}"
        ))),
    }
}

/// Split an optional decimal ackID from the leading edge of `[…]`.
fn split_ack_prefix(body: &str) -> Result<(Option<u64>, &str)> {
    let bracket = body
        .find('[')
        .ok_or_else(|| SockeyeError::MalformedPacket("missing argument array".into()))?;
    let (digits, array) = body.split_at(bracket);
    if digits.is_empty() {
        return Ok((None, array));
    }
    let ack_id = digits
        .parse::<u64>()
        .map_err(|_| SockeyeError::MalformedPacket(format!("bad ackID {digits:?}")))?;
    Ok((Some(ack_id), array))
}

fn parse_array(array: &str) -> Result<Vec<&RawValue>> {
    serde_json::from_str(array)
        .map_err(|e| SockeyeError::MalformedPacket(format!("argument array: {e}")))
}

/// Pull the event name out of `["name",…]`, leaving the remaining elements
/// as a compact JSON array.
fn split_event_array(array: &str) -> Result<(String, String)> {
    let elems = parse_array(array)?;
    let (head, tail) = elems
        .split_first()
        .ok_or_else(|| SockeyeError::MalformedPacket("event array is empty".into()))?;
    let name: String = serde_json::from_str(head.get())
        .map_err(|_| SockeyeError::MalformedPacket("event name is not a string".into()))?;
    Ok((name, rebuild_array(tail)))
}

fn rebuild_array(elems: &[&RawValue]) -> String {
    let mut out = String::from("[");
    for (i, e) in elems.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(e.get());
    }
    out.push(']');
    out
}

/// Prepend the event name to an args array: `["name",…]`.
fn event_array(name: &str, args: &str) -> String {
    let quoted = serde_json::Value::String(name.to_string()).to_string();
    let inner = args.trim();
    match inner.strip_prefix('[') {
        Some(tail) if tail.trim_start() != "]" => format!("[{quoted},{tail}"),
        _ => format!("[{quoted}]"),
    }
}
