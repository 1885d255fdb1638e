//! Wire packet vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use sockeye_core::protocol::{decode_frames, with_length, OpenPayload, Packet};
use sockeye_core::SockeyeError;

#[test]
fn decode_open_handshake() {
    let wire = r#"0{"sid":"GbLW6lCAjcXIpKy_AAAB","upgrades":["websocket"],"pingInterval":30000,"pingTimeout":60000}"#;
    let Packet::Open(raw) = Packet::decode(wire).unwrap() else {
        panic!("expected open");
    };
    let payload = OpenPayload::from_json(&raw).unwrap();
    assert_eq!(payload.sid.len(), 20);
    assert_eq!(payload.upgrades, vec!["websocket".to_string()]);
    assert_eq!(payload.ping_interval, 30000);
    assert_eq!(payload.ping_timeout, 60000);
}

#[test]
fn open_payload_field_names() {
    let payload = OpenPayload {
        sid: "aaaaaaaaaaaaaaaaaaaa".into(),
        upgrades: vec!["websocket".into()],
        ping_interval: 30000,
        ping_timeout: 60000,
    };
    let json = payload.to_json().unwrap();
    assert!(json.contains("\"pingInterval\":30000"));
    assert!(json.contains("\"pingTimeout\":60000"));
    assert!(json.contains("\"upgrades\":[\"websocket\"]"));
}

#[test]
fn decode_event() {
    let p = Packet::decode(r#"42["send",{"x":1}]"#).unwrap();
    assert_eq!(
        p,
        Packet::Event {
            name: "send".into(),
            args: r#"[{"x":1}]"#.into(),
        }
    );
}

#[test]
fn decode_ack_request() {
    let p = Packet::decode(r#"421["join","roomA"]"#).unwrap();
    assert_eq!(
        p,
        Packet::AckRequest {
            name: "join".into(),
            args: r#"["roomA"]"#.into(),
            ack_id: 1,
        }
    );
}

#[test]
fn encode_ack_response() {
    let p = Packet::AckResponse {
        ack_id: 1,
        args: r#"["OK"]"#.into(),
    };
    assert_eq!(p.encode(), r#"431["OK"]"#);
}

#[test]
fn encode_event_without_args() {
    let p = Packet::Event {
        name: "tick".into(),
        args: "[]".into(),
    };
    assert_eq!(p.encode(), r#"42["tick"]"#);
}

#[test]
fn control_packets() {
    assert_eq!(Packet::decode("1").unwrap(), Packet::Close);
    assert_eq!(Packet::decode("2probe").unwrap(), Packet::Ping("probe".into()));
    assert_eq!(Packet::decode("3probe").unwrap(), Packet::Pong("probe".into()));
    assert_eq!(Packet::decode("40").unwrap(), Packet::Connect);
    assert_eq!(Packet::decode("41").unwrap(), Packet::Disconnect);
    assert_eq!(Packet::decode("5").unwrap(), Packet::Upgrade);
    assert_eq!(Packet::decode("6").unwrap(), Packet::Noop);
}

#[test]
fn round_trip() {
    let packets = vec![
        Packet::Open(r#"{"sid":"x"}"#.into()),
        Packet::Close,
        Packet::Ping("probe".into()),
        Packet::Pong(String::new()),
        Packet::Connect,
        Packet::Disconnect,
        Packet::Event {
            name: "send".into(),
            args: r#"[{"x":1},"two"]"#.into(),
        },
        Packet::AckRequest {
            name: "join".into(),
            args: r#"["roomA"]"#.into(),
            ack_id: 7,
        },
        Packet::AckResponse {
            ack_id: 7,
            args: r#"["OK"]"#.into(),
        },
        Packet::Upgrade,
        Packet::Noop,
    ];
    for p in packets {
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p, "wire: {}", p.encode());
    }
}

#[test]
fn malformed_packets() {
    for wire in [
        "",
        "9",
        "4",
        "44oops",
        "42",
        "42[]",
        "42[1]",
        r#"42["send",{"x":}]"#,
        r#"43["OK"]"#,
        "40junk",
        "5x",
    ] {
        let err = Packet::decode(wire).expect_err(wire);
        assert!(matches!(err, SockeyeError::MalformedPacket(_)), "wire: {wire}");
    }
}

#[test]
fn frame_round_trip() {
    let body = format!(
        "{}{}",
        with_length(r#"0{"sid":"x"}"#),
        with_length("6")
    );
    assert_eq!(body, r#"12:0{"sid":"x"}1:6"#);
    let frames = decode_frames(&body).unwrap();
    assert_eq!(frames, vec![r#"0{"sid":"x"}"#.to_string(), "6".to_string()]);
}

#[test]
fn frame_decode_rejects_bad_bodies() {
    assert!(decode_frames("noprefix").is_err());
    assert!(decode_frames("99:short").is_err());
    assert!(decode_frames("x:abc").is_err());
}

#[test]
fn event_frame_matches_poll_body() {
    let p = Packet::Event {
        name: "send".into(),
        args: r#"[{"x":1}]"#.into(),
    };
    assert_eq!(with_length(&p.encode()), r#"18:42["send",{"x":1}]"#);
}
