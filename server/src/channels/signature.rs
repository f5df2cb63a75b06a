//! Webhook and API request signatures for the supported platforms.

use std::collections::BTreeMap;

use hmac::{
    digest::{CtOutput, Output},
    Hmac, Mac,
};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Facebook `X-Hub-Signature-256`: `sha256=<hex hmac of the raw body>`.
pub fn verify_hub_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Zalo OA `X-ZEvent-Signature`: `mac=sha256(appId + body + timestamp + oaSecretKey)`.
pub fn zalo_event_mac(app_id: &str, body: &[u8], timestamp: &str, oa_secret_key: &str) -> String {
    hex::encode(zalo_event_digest(app_id, body, timestamp, oa_secret_key))
}

fn zalo_event_digest(app_id: &str, body: &[u8], timestamp: &str, oa_secret_key: &str) -> Output<Sha256> {
    let mut hasher = Sha256::new();
    hasher.update(app_id.as_bytes());
    hasher.update(body);
    hasher.update(timestamp.as_bytes());
    hasher.update(oa_secret_key.as_bytes());
    hasher.finalize()
}

pub fn verify_zalo_signature(
    oa_secret_key: &str,
    signature_header: Option<&str>,
    app_id: &str,
    timestamp: &str,
    body: &[u8],
) -> bool {
    if oa_secret_key.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("mac=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(provided) = hex::decode(signature) else {
        return false;
    };
    let expected = zalo_event_digest(app_id, body, timestamp, oa_secret_key);
    if provided.len() != expected.len() {
        return false;
    }
    CtOutput::<Sha256>::new(expected)
        == CtOutput::<Sha256>::new(Output::<Sha256>::clone_from_slice(&provided))
}

/// Lazada push `Authorization`: hex hmac-sha256 of `appKey + body`.
pub fn verify_lazada_push(
    app_key: &str,
    app_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(app_key.as_bytes());
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Lazada open-platform request signature: uppercase hex hmac-sha256 over the
/// api path followed by every parameter as `key + value` in key order.
pub fn lazada_request_sign(app_secret: &str, api_path: &str, params: &BTreeMap<String, String>) -> String {
    let mut payload = String::from(api_path);
    for (key, value) in params {
        payload.push_str(key);
        payload.push_str(value);
    }
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return String::new();
    };
    mac.update(payload.as_bytes());
    hex::encode_upper(mac.finalize().into_bytes())
}
