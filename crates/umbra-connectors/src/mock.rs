//! Scripted connector for engine tests
//!
//! Emits a preloaded item sequence exactly once (the stream contract is
//! non-restartable) and records refresh/validate traffic for assertions.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use umbra_core::types::*;

use crate::{
    Capabilities, Connector, ConnectorError, DiscoveryContext, DiscoveryStream,
    ExchangedCredentials, RateLimiter, TokenProbe,
};

/// What a scripted refresh should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    /// Issue a fresh access token, keeping the refresh token
    Succeed,
    /// Terminal OAuth failure
    InvalidGrant,
    /// Transient network failure
    Unavailable,
}

pub struct MockConnector {
    platform: Platform,
    items: Mutex<Vec<Result<DiscoveryItem, ConnectorError>>>,
    limiter: Arc<RateLimiter>,
    refresh_behavior: RefreshBehavior,
    token_valid: bool,
    pub refresh_calls: AtomicU32,
    pub validate_calls: AtomicU32,
    pub discover_calls: AtomicU32,
}

impl MockConnector {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            items: Mutex::new(Vec::new()),
            limiter: Arc::new(RateLimiter::new(1000, 1000.0)),
            refresh_behavior: RefreshBehavior::Succeed,
            token_valid: true,
            refresh_calls: AtomicU32::new(0),
            validate_calls: AtomicU32::new(0),
            discover_calls: AtomicU32::new(0),
        }
    }

    pub fn with_items(self, items: Vec<DiscoveryItem>) -> Self {
        {
            let mut guard = self.items.try_lock().expect("unshared at build time");
            *guard = items.into_iter().map(Ok).collect();
        }
        self
    }

    /// Append a mid-stream error after whatever is already queued
    pub fn with_error(self, error: ConnectorError) -> Self {
        self.items
            .try_lock()
            .expect("unshared at build time")
            .push(Err(error));
        self
    }

    /// Reload the item script for another discovery pass; each pass still
    /// consumes its sequence exactly once
    pub async fn arm(&self, items: Vec<DiscoveryItem>) {
        *self.items.lock().await = items.into_iter().map(Ok).collect();
    }

    /// Reload with an explicit result sequence, errors included
    pub async fn arm_results(&self, items: Vec<Result<DiscoveryItem, ConnectorError>>) {
        *self.items.lock().await = items;
    }

    pub fn with_refresh_behavior(mut self, behavior: RefreshBehavior) -> Self {
        self.refresh_behavior = behavior;
        self
    }

    pub fn with_token_valid(mut self, valid: bool) -> Self {
        self.token_valid = valid;
        self
    }

    /// Convenience: a bot automation item
    pub fn bot(external_id: &str, name: &str) -> DiscoveryItem {
        DiscoveryItem::Automation(NormalizedAutomation {
            external_id: external_id.to_string(),
            automation_type: AutomationType::Bot,
            name: name.to_string(),
            platform_metadata: serde_json::json!({"source": "mock"}),
            permissions: vec!["read".to_string()],
            owner: None,
            vendor_name: umbra_core::vendor::extract_vendor_name(name),
        })
    }

    /// Convenience: an activity event item
    pub fn activity(external_id: Option<&str>, event_type: &str) -> DiscoveryItem {
        DiscoveryItem::Activity(NormalizedActivity {
            automation_external_id: external_id.map(str::to_string),
            actor_id: "mock-actor".to_string(),
            event_type: event_type.to_string(),
            target: None,
            bytes: None,
            records: None,
            occurred_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            discover_automations: true,
            list_users: true,
            fetch_audit_events: true,
            validate_token: true,
        }
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn build_authorization_url(&self, state: &str) -> String {
        format!("https://mock.example/authorize?state={state}")
    }

    async fn exchange_code(&self, code: &str) -> Result<ExchangedCredentials, ConnectorError> {
        Ok(ExchangedCredentials {
            credentials: OAuthCredentials {
                access_token: format!("mock-access-{code}"),
                refresh_token: Some(format!("mock-refresh-{code}")),
                scopes: vec!["read".to_string()],
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            },
            platform_user_id: "mock-user".to_string(),
            display_name: Some("Mock Workspace".to_string()),
            workspace: serde_json::json!({"name": "Mock Workspace"}),
        })
    }

    async fn refresh(&self, creds: &OAuthCredentials) -> Result<OAuthCredentials, ConnectorError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        match self.refresh_behavior {
            RefreshBehavior::Succeed => Ok(OAuthCredentials {
                access_token: format!("{}-refreshed", creds.access_token),
                refresh_token: creds.refresh_token.clone(),
                scopes: creds.scopes.clone(),
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            }),
            RefreshBehavior::InvalidGrant => {
                Err(ConnectorError::InvalidGrant("mock grant revoked".to_string()))
            }
            RefreshBehavior::Unavailable => {
                Err(ConnectorError::Unavailable("mock network down".to_string()))
            }
        }
    }

    async fn revoke(&self, _creds: &OAuthCredentials) -> Result<bool, ConnectorError> {
        Ok(true)
    }

    async fn validate_token(&self, _creds: &OAuthCredentials) -> Result<TokenProbe, ConnectorError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TokenProbe {
            valid: self.token_valid,
            latency_ms: 1.0,
            detail: None,
        })
    }

    async fn discover(&self, _ctx: DiscoveryContext) -> Result<DiscoveryStream, ConnectorError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let items = std::mem::take(&mut *self.items.lock().await);
        let (tx, cancel, stream) = DiscoveryStream::channel();
        tokio::spawn(async move {
            for item in items {
                if cancel.is_cancelled() {
                    return;
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(stream)
    }
}
