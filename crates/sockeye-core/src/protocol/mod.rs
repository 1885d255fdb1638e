//! Wire protocol: packet grammar and polling body framing.

pub mod frame;
pub mod packet;

pub use frame::{decode_frames, with_length};
pub use packet::{OpenPayload, Packet};
