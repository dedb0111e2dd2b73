//! Request fingerprinting for duplicate detection.

use super::types::NormalizedRequest;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// SHA-256 over `key:value` pairs joined by `|` in key order.
///
/// Values are not escaped, so two payloads can only be told apart when their
/// values do not themselves contain `|` or `:`.
pub fn hash_request_payload(payload: &BTreeMap<&str, String>) -> String {
    let canonical = payload
        .iter()
        .map(|(key, value)| format!("{key}:{value}"))
        .collect::<Vec<_>>()
        .join("|");

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Dedup key for a normalized request.
///
/// Covers pair, action, quantity, request id and client ref only; price and
/// signal change on every sample and stay out.
pub fn request_fingerprint(request: &NormalizedRequest) -> String {
    let payload = BTreeMap::from([
        ("pair", request.pair.clone()),
        ("action", request.action.as_str().to_string()),
        ("quantity", request.quantity.normalize().to_string()),
        ("request_id", request.request_id.clone()),
        ("client_ref", request.client_ref.clone().unwrap_or_default()),
    ]);

    hash_request_payload(&payload)
}
