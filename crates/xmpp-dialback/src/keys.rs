//! Dialback key derivation (XEP-0185).
//!
//! ```text
//! hashed_secret = hex(SHA-256(secret))
//! message       = "<receiving> <originating> <stream id>"
//! key           = hex(HMAC-SHA-256(hashed_secret, message))
//! ```
//!
//! The HMAC key is the lowercase *hex text* of the hashed secret, not its raw
//! bytes. Every server implementing XEP-0185 derives keys this way, so any
//! deviation breaks interoperability.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Compute the dialback key for one `(receiving, originating, stream_id)` triple.
pub fn derive_key(secret: &str, receiving: &str, originating: &str, stream_id: &str) -> String {
    let hashed_secret = hex::encode(Sha256::digest(secret.as_bytes()));
    let message = [receiving, originating, stream_id].join(" ");

    // HMAC accepts any key length.
    let mut mac = HmacSha256::new_from_slice(hashed_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Recompute the key locally and compare it with `presented`.
///
/// Plain string equality; the key is already public on the wire.
pub fn check_key(
    secret: &str,
    receiving: &str,
    originating: &str,
    stream_id: &str,
    presented: &str,
) -> bool {
    derive_key(secret, receiving, originating, stream_id) == presented
}
