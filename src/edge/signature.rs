use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use super::{EdgeRejection, EdgeState, MAX_BODY_BYTES};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        // HMAC takes keys of any length
        Err(_) => String::new(),
    }
}

/// Constant-time check of a hex signature, with or without a `sha256=` prefix.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let hex_part = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Webhook signature check. Passes everything through when no secret is configured.
pub async fn verify_signature(
    State(edge): State<EdgeState>,
    req: Request,
    next: Next,
) -> Result<Response, EdgeRejection> {
    let Some(secret) = edge.config.webhook_secret.as_deref() else {
        return Ok(next.run(req).await);
    };

    let (parts, body) = req.into_parts();
    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| EdgeRejection::PayloadTooLarge)?;

    match signature {
        Some(sig) if verify(secret, &bytes, &sig) => {
            Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
        }
        Some(_) => {
            warn!(path = %parts.uri.path(), "Webhook signature mismatch");
            Err(EdgeRejection::InvalidSignature)
        }
        None => {
            warn!(path = %parts.uri.path(), "Webhook signature missing");
            Err(EdgeRejection::InvalidSignature)
        }
    }
}
