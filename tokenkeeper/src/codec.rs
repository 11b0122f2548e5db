//! Inspection of self-describing bearer tokens
//!
//! Access tokens issued by the backend are JWTs. The client never verifies
//! them; it only peeks at the `exp` claim so that renewal can be scheduled
//! ahead of expiry. Anything that does not look like a JWT is reported as
//! having no known expiry.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tokenkeeper_clock::UnixTime;

/// Extracts the expiry instant embedded in a JWT's `exp` claim
///
/// Returns `None` when the token does not have exactly three segments, when
/// the payload segment is not base64url-encoded JSON object, or when the
/// `exp` claim is absent or not a non-negative number.
pub fn decode_expiry(token: &str) -> Option<UnixTime> {
    let mut segments = token.split('.');
    let payload = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(_header), Some(payload), Some(_signature), None) => payload,
        _ => return None,
    };

    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&raw).ok()?;

    let exp = claims.get("exp")?.as_f64()?;
    if !exp.is_finite() || exp < 0. {
        return None;
    }

    Some(UnixTime((exp * 1000.).round() as u64))
}
