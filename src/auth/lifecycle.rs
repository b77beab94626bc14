//! Access token lifecycle: proactive renewal, single-flight refresh, forced logout
//!
//! One `TokenLifecycle` exists per session. It owns the renewal slot and the
//! expiry timer; clones share both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use tokio::task::JoinHandle;

use super::navigator::Navigator;
use super::store::{CredentialKey, CredentialStore};
use super::token::{self, TokenPair};
use crate::api::transport::{ApiRequest, Transport};

/// Refresh endpoint (relative to the backend origin).
pub const REFRESH_PATH: &str = "/api/auth/refresh";

type Renewal = Shared<BoxFuture<'static, bool>>;

struct ExpiryTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn Transport>,
    navigator: Arc<dyn Navigator>,
    in_flight: Mutex<Option<Renewal>>,
    timer: Mutex<Option<ExpiryTimer>>,
    timer_generation: AtomicU64,
    /// Bumped whenever the stored session is replaced or torn down. A refresh
    /// only commits if the epoch it started under is still current.
    epoch: Mutex<u64>,
}

/// Clears the in-flight slot when the renewal task ends, including on panic.
struct InFlightGuard(Arc<Inner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

#[derive(Clone)]
pub struct TokenLifecycle {
    inner: Arc<Inner>,
}

impl TokenLifecycle {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                navigator,
                in_flight: Mutex::new(None),
                timer: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
                epoch: Mutex::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// True when the token is undecodable or past its expiry.
    pub fn is_expired(&self, token: &str) -> bool {
        token::is_expired(token)
    }

    /// Whether a renewal round-trip is currently in flight.
    #[cfg(test)]
    pub fn is_renewing(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Renew the access token.
    ///
    /// Concurrent callers join the renewal already in flight and observe its
    /// outcome; only one refresh round-trip happens per episode. The slot is
    /// cleared before the outcome is published, so a later call starts fresh.
    pub async fn renew(&self) -> bool {
        let renewal = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(existing) => {
                    tracing::debug!("Joining in-flight token renewal");
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let handle = tokio::spawn(async move {
                        let guard = InFlightGuard(Arc::clone(&inner));
                        let ok = inner.refresh_round_trip().await;
                        drop(guard);
                        ok
                    });
                    let renewal = async move { handle.await.unwrap_or(false) }
                        .boxed()
                        .shared();
                    *slot = Some(renewal.clone());
                    renewal
                }
            }
        };
        renewal.await
    }

    /// Renew; on failure, force a logout. Returns whether renewal succeeded.
    pub async fn renew_or_logout(&self) -> bool {
        let ok = self.renew().await;
        if !ok {
            self.force_logout();
        }
        ok
    }

    /// Store a freshly issued credential pair (login) and arm the expiry timer.
    pub fn establish(&self, pair: TokenPair) -> Option<Duration> {
        {
            let mut epoch = self.inner.epoch();
            *epoch += 1;
            self.inner.store_pair(pair);
        }
        self.inner.navigator.leave_login();
        self.inner.schedule()
    }

    /// Re-arm the proactive renewal timer from the stored access token.
    ///
    /// Returns the armed delay; `None` when there is no token or it carries
    /// no decodable expiry. An expired token renews immediately.
    pub fn schedule_expiry_timer(&self) -> Option<Duration> {
        self.inner.schedule()
    }

    #[cfg(test)]
    pub fn has_expiry_timer(&self) -> bool {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Terminal logout: clear credentials, cancel the timer, show login.
    pub fn force_logout(&self) {
        tracing::warn!("Session could not be renewed, logging out");
        self.inner.clear_session();
        self.inner.navigator.navigate_to_login();
    }

    /// User-initiated logout. Same teardown, without the navigation signal.
    pub fn logout(&self) {
        tracing::info!("Logging out");
        self.inner.clear_session();
    }
}

impl Inner {
    fn epoch(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn refresh_round_trip(self: &Arc<Self>) -> bool {
        let (started, refresh_token) = {
            let epoch = self.epoch();
            (*epoch, self.store.refresh_token())
        };
        let Some(refresh_token) = refresh_token else {
            tracing::debug!("No refresh token stored, cannot renew");
            return false;
        };

        tracing::info!("Refreshing access token...");
        let request = ApiRequest {
            method: Method::POST,
            path: REFRESH_PATH.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(serde_json::json!({ "refresh_token": refresh_token })),
        };

        let resp = match self.transport.send(request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("Token refresh failed: {:#}", e);
                return false;
            }
        };

        if !resp.is_success() {
            tracing::warn!("Token refresh rejected (HTTP {})", resp.status.as_u16());
            return false;
        }

        let pair: TokenPair = match resp.json() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Malformed refresh response: {:#}", e);
                return false;
            }
        };
        if pair.access_token.is_empty() {
            tracing::warn!("Refresh response carried an empty access token");
            return false;
        }

        let epoch = self.epoch();
        if *epoch != started {
            // Logged out (nothing stored) or logged in again (fresh pair stored).
            tracing::info!("Session changed during refresh, discarding refreshed token");
            return self.store.access_token().is_some();
        }
        self.store_pair(pair);
        self.schedule();
        drop(epoch);
        tracing::info!("Access token refreshed");
        true
    }

    fn store_pair(&self, pair: TokenPair) {
        self.store.set(CredentialKey::Access, pair.access_token);
        if let Some(refresh_token) = pair.refresh_token {
            self.store.set(CredentialKey::Refresh, refresh_token);
        }
    }

    fn clear_session(&self) {
        let mut epoch = self.epoch();
        *epoch += 1;
        self.store.clear();
        self.cancel_timer();
    }

    fn schedule(self: &Arc<Self>) -> Option<Duration> {
        let mut slot = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.take() {
            old.handle.abort();
        }

        let token = self.store.access_token()?;
        let Some(remaining) = token::remaining_lifetime(&token) else {
            tracing::warn!("Access token has no decodable expiry; proactive renewal disabled");
            return None;
        };

        let delay = token::refresh_delay(remaining);
        if delay.is_zero() {
            tracing::info!("Access token already expired, renewing now");
        } else {
            tracing::debug!("Proactive token renewal in {}s", delay.as_secs());
        }

        let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.release_timer(generation);
            TokenLifecycle { inner }.renew_or_logout().await;
        });

        *slot = Some(ExpiryTimer { generation, handle });
        Some(delay)
    }

    /// Forget a fired timer without aborting it, unless it was already replaced.
    fn release_timer(&self, generation: u64) {
        let mut slot = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|t| t.generation) == Some(generation) {
            slot.take();
        }
    }

    fn cancel_timer(&self) {
        let mut slot = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = slot.take() {
            timer.handle.abort();
            tracing::debug!("Expiry timer cancelled");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self
            .timer
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            timer.handle.abort();
        }
    }
}
