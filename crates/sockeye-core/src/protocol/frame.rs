//! Polling body framing.
//!
//! A polling body is a concatenation of `<decimal-byte-length>:<packet>`
//! frames, decoded left-to-right. Lengths count bytes of the packet text.

use crate::error::{Result, SockeyeError};

/// Wrap one packet's wire text with its length prefix.
pub fn with_length(packet: &str) -> String {
    format!("{}:{}", packet.len(), packet)
}

/// Split a polling body into its packet texts.
pub fn decode_frames(body: &str) -> Result<Vec<String>> {
    let mut frames = Vec::new();
    let mut rest = body;

    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| SockeyeError::MalformedPacket("missing length prefix".into()))?;
        let len: usize = rest[..colon]
            .parse()
            .map_err(|_| SockeyeError::MalformedPacket(format!("bad length {:?}", &rest[..colon])))?;
        let after = &rest[colon + 1..];
        let frame = after
            .get(..len)
            .ok_or_else(|| SockeyeError::MalformedPacket("length exceeds body".into()))?;
        frames.push(frame.to_string());
        rest = &after[len..];
    }

    Ok(frames)
}
