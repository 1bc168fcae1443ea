// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signed webhook delivery.
//!
//! The notification body is signed with HMAC-SHA-256 over the exact bytes
//! sent; the standard (not URL-safe) base64 encoding of the digest travels in
//! the `x-osb-signature` header. The signing secret only ever lives in task
//! metadata.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-osb-signature";

/// Body announcing a service became available.
pub const CREATED_BODY: &str = r#"{"state":"succeeded","description":"available"}"#;

/// Sign `body` with `secret`: base64(HMAC-SHA-256(body, secret)).
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// POST the creation notification to `url`. Returns the response status; the
/// caller decides whether a non-success status retries or fails.
pub async fn deliver_created(
    client: &reqwest::Client,
    url: &str,
    secret: &str,
) -> Result<reqwest::StatusCode, reqwest::Error> {
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, sign(CREATED_BODY.as_bytes(), secret))
        .body(CREATED_BODY)
        .send()
        .await?;
    Ok(response.status())
}

/// Success is anything in 2xx-3xx.
pub fn is_delivered(status: reqwest::StatusCode) -> bool {
    (200..400).contains(&status.as_u16())
}
