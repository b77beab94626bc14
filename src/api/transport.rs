//! HTTP transport seam between the gateway and reqwest

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use super::error::ApiError;

/// A fully-resolved outbound request (path is relative to the backend origin).
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A buffered response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Issues one request round-trip.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError>;
}

/// reqwest-backed transport rooted at the backend origin.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    fn resolve(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.resolve(&request.path)?;
        tracing::debug!(
            "{} {} (authenticated: {})",
            request.method,
            url,
            request.header("Authorization").is_some()
        );

        let mut builder = self.http.request(request.method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(serde_json::to_vec(body)?);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        tracing::debug!("{} {} -> {}", request.method, request.path, status.as_u16());

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted transport: replies per path in FIFO order, records every request.
    #[derive(Default)]
    pub struct FakeTransport {
        replies: Mutex<Vec<(String, VecDeque<Result<ApiResponse, String>>)>>,
        pub requests: Mutex<Vec<ApiRequest>>,
        pub delay: Option<Duration>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn reply(&self, path: &str, status: u16, body: &str) -> &Self {
            self.push(path, Ok(ApiResponse::new(status, body.as_bytes().to_vec())))
        }

        pub fn fail(&self, path: &str, message: &str) -> &Self {
            self.push(path, Err(message.to_string()))
        }

        fn push(&self, path: &str, reply: Result<ApiResponse, String>) -> &Self {
            let mut guard = self.replies.lock().unwrap();
            match guard.iter_mut().find(|(p, _)| p == path) {
                Some((_, queue)) => queue.push_back(reply),
                None => guard.push((path.to_string(), VecDeque::from([reply]))),
            }
            self
        }

        pub fn calls_to(&self, path: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.path == path)
                .count()
        }

        pub fn recorded(&self) -> Vec<ApiRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
            let path = request.path.clone();
            self.requests.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = {
                let mut guard = self.replies.lock().unwrap();
                guard
                    .iter_mut()
                    .find(|(p, _)| *p == path)
                    .and_then(|(_, queue)| queue.pop_front())
            };
            match reply {
                Some(Ok(resp)) => Ok(resp),
                Some(Err(message)) => Err(ApiError::InvalidResponse(message)),
                None => Ok(ApiResponse::new(404, r#"{"detail":"Not Found"}"#)),
            }
        }
    }
}
