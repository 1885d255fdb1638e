//! Session id generation.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use md5::{Digest, Md5};
use rand::RngCore;

/// 20-char URL-safe session id derived from the remote address, the current
/// time and 64 random bits.
pub(crate) fn generate(remote_addr: &str) -> String {
    let mut salt = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut salt);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    let mut hasher = Md5::new();
    hasher.update(remote_addr.as_bytes());
    hasher.update(now.as_nanos().to_le_bytes());
    hasher.update(salt);

    let mut sid = URL_SAFE.encode(hasher.finalize());
    sid.truncate(20);
    sid
}

#[cfg(test)]
mod tests {
    use super::generate;

    #[test]
    fn sid_is_twenty_chars_and_unique() {
        let a = generate("127.0.0.1:4000");
        let b = generate("127.0.0.1:4000");
        assert_eq!(a.len(), 20);
        assert_eq!(b.len(), 20);
        assert_ne!(a, b);
    }
}
