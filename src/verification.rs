use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Verify an `X-Hub-Signature-256` header value ("sha256=<hex>") against
/// the raw request body.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> bool {
    let expected = match signature_header
        .strip_prefix("sha256=")
        .and_then(|h| hex::decode(h).ok())
    {
        Some(bytes) => bytes,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);

    // verify_slice compares in constant time and rejects truncated tags.
    mac.verify_slice(&expected).is_ok()
}

/// Compute the header value the platform would send for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Subscription handshake check: returns the challenge to echo back when
/// the mode is "subscribe" and the token matches.
pub fn verify_subscription<'a>(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&'a str>,
    expected_token: &str,
) -> Option<&'a str> {
    if mode == Some("subscribe") && token == Some(expected_token) {
        Some(challenge.unwrap_or(""))
    } else {
        None
    }
}
