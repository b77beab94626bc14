//! Session facade
//!
//! Wires one credential store, one token lifecycle, one authenticated client
//! and one realtime channel together. Callers (CLI commands, polling loops)
//! talk to this instead of the parts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use crate::api::{ApiClient, ApiError, ApiResponse, HttpTransport, RequestOptions, Transport};
use crate::auth::{
    ConsoleNavigator, CredentialStore, FileStore, Navigator, TokenLifecycle, TokenPair,
};
use crate::config::Config;
use crate::realtime::registry::{Handler, Subscription};
use crate::realtime::{ChannelConfig, ConnectionState, RealtimeChannel};

#[derive(Clone)]
pub struct Session {
    lifecycle: TokenLifecycle,
    api: ApiClient,
    channel: RealtimeChannel,
    /// Set once the first authenticated fetch has brought the channel up.
    auto_connected: Arc<AtomicBool>,
}

impl Session {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
        channel: ChannelConfig,
    ) -> Self {
        let lifecycle = TokenLifecycle::new(store, Arc::clone(&transport), navigator);
        let api = ApiClient::new(transport, lifecycle.clone());
        Self {
            lifecycle,
            api,
            channel: RealtimeChannel::new(channel),
            auto_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Production wiring: HTTP transport, config-file credentials, console
    /// navigation.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = FileStore::open().context("Failed to open credential store")?;
        Self::with_store(config, Arc::new(store))
    }

    /// Production wiring over a caller-supplied credential store.
    pub fn with_store(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let transport = HttpTransport::new(&config.base_url, config.request_timeout())
            .context("Failed to build HTTP client")?;
        let channel = ChannelConfig::from_config(config).context("Invalid realtime endpoint")?;
        Ok(Self::new(
            store,
            Arc::new(transport),
            Arc::new(ConsoleNavigator::new()),
            channel,
        ))
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn lifecycle(&self) -> &TokenLifecycle {
        &self.lifecycle
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        self.lifecycle.store()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store().access_token().is_some()
    }

    /// Adopt a freshly issued credential pair and bring the channel up.
    pub fn establish(&self, pair: TokenPair) -> Option<Duration> {
        let delay = self.lifecycle.establish(pair);
        self.auto_connected.store(true, Ordering::SeqCst);
        self.channel.connect();
        delay
    }

    /// Resume a stored session: arm the expiry timer for the persisted token.
    pub fn resume(&self) -> Option<Duration> {
        self.lifecycle.schedule_expiry_timer()
    }

    pub async fn renew_or_logout(&self) -> bool {
        self.lifecycle.renew_or_logout().await
    }

    /// User-initiated logout: clear credentials, stop the timer, close the
    /// channel.
    pub fn logout(&self) {
        self.lifecycle.logout();
        self.channel.disconnect();
        self.auto_connected.store(false, Ordering::SeqCst);
    }

    /// Authenticated request. The first one made with a credential also
    /// connects the realtime channel.
    pub async fn fetch(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let resp = self.api.request(path, options).await?;
        self.auto_connect();
        Ok(resp)
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let value = self.api.request_json(path, options).await?;
        self.auto_connect();
        Ok(value)
    }

    fn auto_connect(&self) {
        if !self.is_authenticated() {
            return;
        }
        if !self.auto_connected.swap(true, Ordering::SeqCst)
            && self.channel.state() == ConnectionState::Disconnected
        {
            tracing::debug!("First authenticated request, connecting realtime channel");
            self.channel.connect();
        }
    }

    pub fn subscribe(&self, event: &str, handler: Handler) -> Subscription {
        self.channel.on(event, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.channel.unsubscribe(subscription)
    }

    /// Remove every registration of `handler` under `event`.
    pub fn off(&self, event: &str, handler: &Handler) -> usize {
        self.channel.off(event, handler)
    }

    pub fn connect(&self) {
        self.channel.connect();
    }

    pub fn disconnect(&self) {
        self.channel.disconnect();
    }
}
