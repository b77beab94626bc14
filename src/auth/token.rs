//! Access credential decoding and renewal timing

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Renew this long before expiry, unless the token is short-lived.
const MAX_REFRESH_MARGIN: Duration = Duration::from_secs(30);
/// Never arm a timer closer than this.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Credentials returned by login and by the refresh endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Decode the `exp` claim from the token's payload segment.
///
/// Returns `None` for anything that is not a JWT with a numeric `exp`.
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.exp?;
    if !exp.is_finite() || exp <= 0.0 {
        return None;
    }
    // Past chrono's range means "never" for renewal purposes.
    let secs = exp.trunc();
    if secs >= i64::MAX as f64 {
        return Some(DateTime::<Utc>::MAX_UTC);
    }
    let nanos = ((exp - secs) * 1e9) as u32;
    Some(DateTime::from_timestamp(secs as i64, nanos).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

/// True when the token is undecodable or its expiry has passed.
pub fn is_expired(token: &str) -> bool {
    match expires_at(token) {
        Some(exp) => Utc::now() >= exp,
        None => true,
    }
}

/// Time left before the token expires. Zero if already expired, `None` if
/// the token carries no usable expiry.
pub fn remaining_lifetime(token: &str) -> Option<Duration> {
    let exp = expires_at(token)?;
    Some((exp - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

/// Delay before a proactive renewal, given the remaining lifetime.
///
/// The margin is 30s, or half the remaining lifetime for short-lived tokens.
/// The result is floored at 1s; an expired token renews immediately.
pub fn refresh_delay(remaining: Duration) -> Duration {
    if remaining.is_zero() {
        return Duration::ZERO;
    }
    let margin = MAX_REFRESH_MARGIN.min(remaining / 2);
    remaining.saturating_sub(margin).max(MIN_REFRESH_DELAY)
}

/// Build an unsigned JWT carrying only an `exp` claim.
#[cfg(test)]
pub(crate) fn jwt_with_exp(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"7","exp":{}}}"#, exp));
    format!("{}.{}.signature", header, payload)
}

/// JWT expiring `secs` from now (negative for the past).
#[cfg(test)]
pub(crate) fn jwt_expiring_in(secs: i64) -> String {
    jwt_with_exp(Utc::now().timestamp() + secs)
}
