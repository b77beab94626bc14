//! Authenticated HTTP gateway for the market API
//!
//! Attaches the stored bearer token, and on a 401 renews once (joining any
//! renewal already in flight) and retries once.

use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;

use super::error::ApiError;
use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::auth::{CredentialStore, TokenLifecycle};

/// API namespace every resource path lives under.
pub const API_PREFIX: &str = "/api";

/// Per-call request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn put(body: serde_json::Value) -> Self {
        Self {
            method: Method::PUT,
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn delete() -> Self {
        Self {
            method: Method::DELETE,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Prefix `path` with the API namespace unless it already carries it.
pub fn normalize_path(path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if path == API_PREFIX || path.starts_with("/api/") || path.starts_with("/api?") {
        path
    } else {
        format!("{}{}", API_PREFIX, path)
    }
}

/// Authenticated client shared by every caller in the process.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    lifecycle: TokenLifecycle,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, lifecycle: TokenLifecycle) -> Self {
        Self {
            transport,
            lifecycle,
        }
    }

    fn store(&self) -> &Arc<dyn CredentialStore> {
        self.lifecycle.store()
    }

    /// Build the outbound request with the current credential.
    fn build(&self, path: &str, options: &RequestOptions) -> ApiRequest {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(token) = self.store().access_token() {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        // Caller headers replace defaults of the same name.
        for (name, value) in &options.headers {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }

        ApiRequest {
            method: options.method.clone(),
            path: path.to_string(),
            headers,
            body: options.body.clone(),
        }
    }

    /// Issue a request. At most one renew-and-retry per call.
    ///
    /// A 401 that survives renewal (or a failed renewal) forces a logout and
    /// the failed response is returned. Other statuses pass through untouched.
    pub async fn request(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let path = normalize_path(path);
        let mut resp = self.transport.send(self.build(&path, &options)).await?;

        if resp.is_unauthorized() {
            tracing::debug!("401 for {}, attempting token renewal", path);
            if self.lifecycle.renew().await {
                resp = self.transport.send(self.build(&path, &options)).await?;
            }
            if resp.is_unauthorized() {
                self.lifecycle.force_logout();
            }
        }

        Ok(resp)
    }

    /// Issue a request and decode a successful JSON body.
    ///
    /// Non-2xx final responses become `ApiError::Status` carrying the server's
    /// `detail` message when present.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let resp = self.request(path, options).await?;
        if !resp.is_success() {
            return Err(ApiError::from_status(resp.status.as_u16(), &resp.body));
        }
        resp.json()
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ApiError> {
        self.request_json(path, RequestOptions::post(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::testing::FakeTransport;
    use crate::auth::lifecycle::REFRESH_PATH;
    use crate::auth::navigator::testing::RecordingNavigator;
    use crate::auth::store::MemoryStore;
    use crate::auth::token::jwt_expiring_in;
    use std::time::Duration;

    struct Harness {
        client: ApiClient,
        store: Arc<MemoryStore>,
        transport: Arc<FakeTransport>,
        navigator: Arc<RecordingNavigator>,
    }

    fn harness(transport: FakeTransport, access: Option<&str>, refresh: Option<&str>) -> Harness {
        let store = Arc::new(MemoryStore::with_tokens(access, refresh));
        let transport = Arc::new(transport);
        let navigator = Arc::new(RecordingNavigator::default());
        let lifecycle = TokenLifecycle::new(store.clone(), transport.clone(), navigator.clone());
        Harness {
            client: ApiClient::new(transport.clone(), lifecycle),
            store,
            transport,
            navigator,
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/offers/"), "/api/offers/");
        assert_eq!(normalize_path("offers"), "/api/offers");
        assert_eq!(normalize_path("/api/offers"), "/api/offers");
        assert_eq!(normalize_path("/api"), "/api");
        assert_eq!(normalize_path("/apiary"), "/api/apiary");
    }

    #[tokio::test]
    async fn test_attaches_bearer_and_caller_headers() {
        let transport = FakeTransport::new();
        transport.reply("/api/offers/", 200, "[]");
        let h = harness(transport, Some("tok"), None);

        let options = RequestOptions::get()
            .header("X-Trace", "abc")
            .header("content-type", "text/plain");
        let resp = h.client.request("/offers/", options).await.unwrap();
        assert_eq!(resp.status.as_u16(), 200);

        let recorded = h.transport.recorded();
        let sent = &recorded[0];
        assert_eq!(sent.path, "/api/offers/");
        assert_eq!(sent.header("Authorization"), Some("Bearer tok"));
        assert_eq!(sent.header("X-Trace"), Some("abc"));
        assert_eq!(sent.header("Content-Type"), Some("text/plain"));
        assert_eq!(
            sent.headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_no_credential_omits_authorization() {
        let transport = FakeTransport::new();
        transport.reply("/api/auth/request-otp", 200, "{}");
        let h = harness(transport, None, None);

        h.client
            .request("/auth/request-otp", RequestOptions::post(serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(h.transport.recorded()[0].header("Authorization"), None);
    }

    #[tokio::test]
    async fn test_401_renews_and_retries_once() {
        let renewed = jwt_expiring_in(3600);
        let transport = FakeTransport::new();
        transport
            .reply("/api/offers/", 401, r#"{"detail":"expired"}"#)
            .reply("/api/offers/", 200, r#"[{"id":1}]"#)
            .reply(
                REFRESH_PATH,
                200,
                &serde_json::json!({ "access_token": renewed }).to_string(),
            );
        let h = harness(transport, Some("stale"), Some("r1"));

        let resp = h.client.request("/offers/", RequestOptions::get()).await.unwrap();

        assert_eq!(resp.status.as_u16(), 200);
        assert_eq!(h.transport.calls_to("/api/offers/"), 2);
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        let recorded = h.transport.recorded();
        let retry = &recorded[2];
        assert_eq!(
            retry.header("Authorization"),
            Some(format!("Bearer {}", renewed).as_str())
        );
        assert_eq!(h.navigator.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_renewal_returns_401_and_logs_out() {
        let transport = FakeTransport::new();
        transport
            .reply("/api/offers/", 401, r#"{"detail":"expired"}"#)
            .reply(REFRESH_PATH, 401, "");
        let h = harness(transport, Some("stale"), Some("r1"));

        let resp = h.client.request("/offers/", RequestOptions::get()).await.unwrap();

        assert_eq!(resp.status.as_u16(), 401);
        assert_eq!(h.transport.calls_to("/api/offers/"), 1);
        assert_eq!(h.navigator.count(), 1);
        assert!(h.store.access_token().is_none());
        assert!(h.store.refresh_token().is_none());
    }

    #[tokio::test]
    async fn test_retry_still_unauthorized_logs_out_without_looping() {
        let transport = FakeTransport::new();
        transport
            .reply("/api/offers/", 401, "")
            .reply("/api/offers/", 401, "")
            .reply("/api/offers/", 200, "[]")
            .reply(
                REFRESH_PATH,
                200,
                &serde_json::json!({ "access_token": jwt_expiring_in(600) }).to_string(),
            );
        let h = harness(transport, Some("stale"), Some("r1"));

        let resp = h.client.request("/offers/", RequestOptions::get()).await.unwrap();

        assert_eq!(resp.status.as_u16(), 401);
        assert_eq!(h.transport.calls_to("/api/offers/"), 2);
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        assert_eq!(h.navigator.count(), 1);
    }

    #[tokio::test]
    async fn test_other_statuses_pass_through() {
        let transport = FakeTransport::new();
        transport.reply("/api/offers/9", 404, r#"{"detail":"Offer not found"}"#);
        let h = harness(transport, Some("tok"), Some("r1"));

        let resp = h.client.request("/offers/9", RequestOptions::get()).await.unwrap();
        assert_eq!(resp.status.as_u16(), 404);
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 0);
        assert_eq!(h.navigator.count(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let transport = FakeTransport::new();
        transport.fail("/api/offers/", "unreachable");
        let h = harness(transport, Some("tok"), Some("r1"));

        let err = h
            .client
            .request("/offers/", RequestOptions::get())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_401s_share_renewal() {
        let renewed = jwt_expiring_in(3600);
        let transport = FakeTransport::with_delay(Duration::from_millis(20));
        for _ in 0..3 {
            transport.reply("/api/offers/", 401, "");
        }
        for _ in 0..3 {
            transport.reply("/api/offers/", 200, "[]");
        }
        transport.reply(
            REFRESH_PATH,
            200,
            &serde_json::json!({ "access_token": renewed }).to_string(),
        );
        let h = harness(transport, Some("stale"), Some("r1"));

        let (a, b, c) = tokio::join!(
            h.client.request("/offers/", RequestOptions::get()),
            h.client.request("/offers/", RequestOptions::get()),
            h.client.request("/offers/", RequestOptions::get()),
        );

        for resp in [a, b, c] {
            assert_eq!(resp.unwrap().status.as_u16(), 200);
        }
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn test_request_json_success_and_detail_error() {
        let transport = FakeTransport::new();
        transport
            .reply("/api/offers/", 200, r#"[{"id":"42"}]"#)
            .reply("/api/offers/", 400, r#"{"detail":"Offer quantity too low"}"#);
        let h = harness(transport, Some("tok"), None);

        let offers: Vec<serde_json::Value> = h
            .client
            .request_json("/offers/", RequestOptions::get())
            .await
            .unwrap();
        assert_eq!(offers[0]["id"], "42");

        let err = h
            .client
            .post_json::<serde_json::Value>("/offers/", serde_json::json!({ "quantity": 1 }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP 400: Offer quantity too low");
    }

    #[tokio::test]
    async fn test_request_json_final_401_is_error() {
        let transport = FakeTransport::new();
        transport.reply("/api/users/me", 401, "");
        let h = harness(transport, Some("stale"), None);

        let err = h
            .client
            .request_json::<serde_json::Value>("/users/me", RequestOptions::get())
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(h.navigator.count(), 1);
    }
}
