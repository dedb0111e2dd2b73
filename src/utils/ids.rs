//! Identifier generation and secret masking.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use uuid::Uuid;

const TRANSACTION_ID_BYTES: usize = 20;

/// Generate a correlation id for requests that arrive without one.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a URL-safe transaction id from 20 random bytes.
pub fn generate_transaction_id() -> String {
    let mut bytes = [0u8; TRANSACTION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Masked form of a secret, safe to log.
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        None | Some("") => "<not-set>".to_string(),
        Some(s) if s.chars().count() <= 4 => "*".repeat(s.chars().count()),
        Some(s) => {
            let chars: Vec<char> = s.chars().collect();
            let head: String = chars[..2].iter().collect();
            let tail: String = chars[chars.len() - 2..].iter().collect();
            format!("{head}***{tail}")
        }
    }
}
