//! One-time-password login against the market backend
//!
//! The backend sends the code to the user's Telegram account; the verified
//! code is exchanged for a credential pair.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::token::TokenPair;
use crate::api::client::ApiClient;

const REQUEST_OTP_PATH: &str = "/auth/request-otp";
const VERIFY_OTP_PATH: &str = "/auth/verify-otp";

/// Client platform reported when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    TelegramMiniApp,
    Web,
    Android,
}

#[derive(Debug, Serialize)]
struct OtpRequest<'a> {
    mobile_number: &'a str,
}

#[derive(Debug, Serialize)]
struct OtpVerify<'a> {
    mobile_number: &'a str,
    otp: &'a str,
    platform: Platform,
    device_fingerprint: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: Option<String>,
}

/// Ask the backend to send a login code. Returns the server's message.
pub async fn request_otp(api: &ApiClient, mobile_number: &str) -> Result<String> {
    tracing::info!("Requesting login code...");
    let body = serde_json::to_value(OtpRequest { mobile_number })?;
    let resp: MessageResponse = api
        .post_json(REQUEST_OTP_PATH, body)
        .await
        .context("Failed to request login code")?;
    Ok(resp
        .message
        .unwrap_or_else(|| "Login code sent.".to_string()))
}

/// Exchange a login code for a credential pair.
pub async fn verify_otp(
    api: &ApiClient,
    mobile_number: &str,
    otp: &str,
    platform: Platform,
    device_fingerprint: &str,
) -> Result<TokenPair> {
    let body = serde_json::to_value(OtpVerify {
        mobile_number,
        otp: otp.trim(),
        platform,
        device_fingerprint,
    })?;
    api.post_json(VERIFY_OTP_PATH, body)
        .await
        .context("Failed to verify login code")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::testing::FakeTransport;
    use crate::auth::navigator::testing::RecordingNavigator;
    use crate::auth::store::MemoryStore;
    use crate::auth::TokenLifecycle;
    use std::sync::Arc;

    fn client(transport: Arc<FakeTransport>) -> ApiClient {
        let lifecycle = TokenLifecycle::new(
            Arc::new(MemoryStore::new()),
            transport.clone(),
            Arc::new(RecordingNavigator::default()),
        );
        ApiClient::new(transport, lifecycle)
    }

    #[test]
    fn test_platform_wire_names() {
        assert_eq!(
            serde_json::to_value(Platform::TelegramMiniApp).unwrap(),
            "telegram_mini_app"
        );
        assert_eq!(serde_json::to_value(Platform::Web).unwrap(), "web");
    }

    #[tokio::test]
    async fn test_verify_otp_posts_payload() {
        let transport = Arc::new(FakeTransport::new());
        transport.reply(
            "/api/auth/verify-otp",
            200,
            r#"{"access_token":"a.b.c","token_type":"bearer"}"#,
        );
        let api = client(transport.clone());

        let pair = verify_otp(&api, "09120000000", " 123456\n", Platform::Web, "fp-1")
            .await
            .unwrap();
        assert_eq!(pair.access_token, "a.b.c");
        assert_eq!(pair.refresh_token, None);

        let sent = transport.recorded();
        assert_eq!(
            sent[0].body,
            Some(serde_json::json!({
                "mobile_number": "09120000000",
                "otp": "123456",
                "platform": "web",
                "device_fingerprint": "fp-1",
            }))
        );
    }

    #[tokio::test]
    async fn test_request_otp_surfaces_detail() {
        let transport = Arc::new(FakeTransport::new());
        transport.reply(
            "/api/auth/request-otp",
            404,
            r#"{"detail":"Mobile number not found."}"#,
        );
        let api = client(transport);

        let err = request_otp(&api, "0900").await.unwrap_err();
        assert!(format!("{:#}", err).contains("Mobile number not found."));
    }
}
