//! Generative-AI platform connector
//!
//! One adapter parameterized by provider (ChatGPT, Claude, Gemini). All
//! three expose an organization admin surface with service accounts, an
//! assistant/agent registry, and an audit-log feed; the per-provider
//! differences are base URLs and payload spellings handled here.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use umbra_core::config::OAuthClientConfig;
use umbra_core::types::*;
use umbra_core::vendor::extract_vendor_name;

use crate::{
    classify_status, retry_after_secs, with_backoff, Capabilities, Connector, ConnectorError,
    DiscoveryContext, DiscoveryStream, ExchangedCredentials, RateLimiter, TokenProbe,
};

const AI_BUCKET: u32 = 30;
const AI_REFILL_PER_SEC: f64 = 1.0;

pub struct AiPlatformConnector {
    http: reqwest::Client,
    provider: Platform,
    base_url: String,
    oauth: OAuthClientConfig,
    limiter: Arc<RateLimiter>,
}

impl AiPlatformConnector {
    /// Build for one of the AI providers; panics are avoided by falling back
    /// to the ChatGPT surface for non-AI platforms
    pub fn new(provider: Platform, oauth: OAuthClientConfig) -> Self {
        let base_url = match provider {
            Platform::Claude => "https://api.anthropic.com",
            Platform::Gemini => "https://generativelanguage.googleapis.com",
            _ => "https://api.openai.com",
        };
        Self::with_base_url(provider, oauth, base_url.to_string())
    }

    /// Base URL override for tests
    pub fn with_base_url(provider: Platform, oauth: OAuthClientConfig, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider,
            base_url,
            oauth,
            limiter: Arc::new(RateLimiter::new(AI_BUCKET, AI_REFILL_PER_SEC)),
        }
    }

    async fn api_get(
        http: &reqwest::Client,
        token: &str,
        url: &str,
    ) -> Result<Value, ConnectorError> {
        let response = http.get(url).bearer_auth(token).send().await?;
        let retry = retry_after_secs(response.headers());
        if let Some(err) = classify_status(response.status(), retry) {
            return Err(err);
        }
        response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))
    }
}

/// Normalize an organization service account
pub fn normalize_service_account(item: &Value) -> Option<NormalizedAutomation> {
    let id = item.get("id")?.as_str()?.to_string();
    let name = item
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("service account")
        .to_string();
    Some(NormalizedAutomation {
        external_id: id,
        automation_type: AutomationType::ServiceAccount,
        name: name.clone(),
        platform_metadata: item.clone(),
        permissions: item
            .get("role")
            .and_then(Value::as_str)
            .map(|r| vec![r.to_string()])
            .unwrap_or_default(),
        owner: item.get("created_by").and_then(Value::as_str).map(str::to_string),
        vendor_name: extract_vendor_name(&name),
    })
}

/// Normalize an assistant/agent definition into a bot automation
pub fn normalize_assistant(item: &Value) -> Option<NormalizedAutomation> {
    let id = item.get("id")?.as_str()?.to_string();
    let name = item
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("assistant")
        .to_string();
    let tools: Vec<String> = item
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.get("type").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(NormalizedAutomation {
        external_id: id,
        automation_type: AutomationType::Bot,
        name: name.clone(),
        platform_metadata: item.clone(),
        permissions: tools,
        owner: None,
        vendor_name: extract_vendor_name(&name),
    })
}

/// Normalize an audit-log entry
pub fn normalize_audit_entry(item: &Value) -> Option<NormalizedActivity> {
    let occurred_at = item
        .get("effective_at")
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);
    Some(NormalizedActivity {
        automation_external_id: item
            .pointer("/actor/api_key/service_account/id")
            .and_then(Value::as_str)
            .map(str::to_string),
        actor_id: item
            .pointer("/actor/session/user/email")
            .or_else(|| item.pointer("/actor/api_key/id"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        event_type: item
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("audit_event")
            .to_string(),
        target: item
            .pointer("/project/name")
            .and_then(Value::as_str)
            .map(str::to_string),
        bytes: None,
        records: item.get("usage_count").and_then(Value::as_u64),
        occurred_at,
    })
}

#[async_trait]
impl Connector for AiPlatformConnector {
    fn platform(&self) -> Platform {
        self.provider
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            discover_automations: true,
            list_users: false,
            fetch_audit_events: true,
            validate_token: true,
        }
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn build_authorization_url(&self, state: &str) -> String {
        format!(
            "{}/oauth/authorize?client_id={}&response_type=code&scope=org.read%20audit_logs.read&state={}&redirect_uri={}",
            self.base_url, self.oauth.client_id, state, self.oauth.redirect_uri
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ExchangedCredentials, ConnectorError> {
        self.limiter.acquire().await;
        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .form(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.oauth.redirect_uri.as_str()),
            ])
            .send()
            .await?;
        if let Some(err) = classify_status(response.status(), retry_after_secs(response.headers())) {
            return Err(err);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Decode("missing access_token".to_string()))?
            .to_string();

        let org = Self::api_get(
            &self.http,
            &access_token,
            &format!("{}/v1/organization", self.base_url),
        )
        .await
        .unwrap_or(Value::Null);

        Ok(ExchangedCredentials {
            credentials: OAuthCredentials {
                access_token,
                refresh_token: body
                    .get("refresh_token")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                scopes: body
                    .get("scope")
                    .and_then(Value::as_str)
                    .map(|s| s.split(' ').map(str::to_string).collect())
                    .unwrap_or_default(),
                expires_at: body
                    .get("expires_in")
                    .and_then(Value::as_i64)
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            },
            platform_user_id: org
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("organization")
                .to_string(),
            display_name: org.get("name").and_then(Value::as_str).map(str::to_string),
            workspace: org,
        })
    }

    async fn refresh(&self, creds: &OAuthCredentials) -> Result<OAuthCredentials, ConnectorError> {
        let refresh_token = creds
            .refresh_token
            .as_deref()
            .ok_or_else(|| ConnectorError::InvalidGrant("no refresh token on record".to_string()))?;

        self.limiter.acquire().await;
        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .form(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            return Err(ConnectorError::InvalidGrant("refresh rejected".to_string()));
        }
        if let Some(err) = classify_status(status, None) {
            return Err(err);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Decode("missing access_token".to_string()))?
            .to_string();
        Ok(OAuthCredentials {
            access_token,
            refresh_token: body
                .get("refresh_token")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| creds.refresh_token.clone()),
            scopes: creds.scopes.clone(),
            expires_at: body
                .get("expires_in")
                .and_then(Value::as_i64)
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }

    async fn revoke(&self, creds: &OAuthCredentials) -> Result<bool, ConnectorError> {
        self.limiter.acquire().await;
        let response = self
            .http
            .post(format!("{}/oauth/revoke", self.base_url))
            .form(&[("token", creds.access_token.as_str())])
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn validate_token(&self, creds: &OAuthCredentials) -> Result<TokenProbe, ConnectorError> {
        self.limiter.acquire().await;
        let start = std::time::Instant::now();
        let result = Self::api_get(
            &self.http,
            &creds.access_token,
            &format!("{}/v1/models", self.base_url),
        )
        .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(_) => Ok(TokenProbe { valid: true, latency_ms, detail: None }),
            Err(ConnectorError::InvalidGrant(detail)) => Ok(TokenProbe {
                valid: false,
                latency_ms,
                detail: Some(detail),
            }),
            Err(err) => Err(err),
        }
    }

    async fn discover(&self, ctx: DiscoveryContext) -> Result<DiscoveryStream, ConnectorError> {
        let (tx, cancel, stream) = DiscoveryStream::channel();
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let limiter = self.limiter.clone();
        let token = ctx.credentials.access_token.clone();

        tokio::spawn(async move {
            // Service accounts
            limiter.acquire().await;
            let service_accounts_url = format!("{base_url}/v1/organization/service_accounts");
            match with_backoff("ai.service_accounts", 3, || {
                Self::api_get(&http, &token, &service_accounts_url)
            })
            .await
            {
                Ok(body) => {
                    for item in body
                        .get("data")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                    {
                        if let Some(account) = normalize_service_account(item) {
                            if tx.send(Ok(DiscoveryItem::Automation(account))).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    let fatal = !err.is_transient();
                    let _ = tx.send(Err(err)).await;
                    if fatal {
                        return;
                    }
                }
            }

            // Assistants / agents
            if cancel.is_cancelled() {
                return;
            }
            limiter.acquire().await;
            let assistants_url = format!("{base_url}/v1/assistants?limit=100");
            match with_backoff("ai.assistants", 3, || {
                Self::api_get(&http, &token, &assistants_url)
            })
            .await
            {
                Ok(body) => {
                    for item in body
                        .get("data")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                    {
                        if let Some(assistant) = normalize_assistant(item) {
                            if tx.send(Ok(DiscoveryItem::Automation(assistant))).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }

            // Audit feed
            if cancel.is_cancelled() {
                return;
            }
            limiter.acquire().await;
            let audit_logs_url = format!("{base_url}/v1/organization/audit_logs?limit=200");
            match with_backoff("ai.audit_logs", 3, || {
                Self::api_get(&http, &token, &audit_logs_url)
            })
            .await
            {
                Ok(body) => {
                    for item in body
                        .get("data")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                    {
                        if let Some(event) = normalize_audit_entry(item) {
                            if tx.send(Ok(DiscoveryItem::Activity(event))).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_accounts_normalize() {
        let item = json!({
            "id": "svc_acct_1",
            "name": "ci-pipeline",
            "role": "member",
            "created_by": "admin@acme.com"
        });
        let account = normalize_service_account(&item).unwrap();
        assert_eq!(account.automation_type, AutomationType::ServiceAccount);
        assert_eq!(account.permissions, vec!["member"]);
        assert_eq!(account.owner.as_deref(), Some("admin@acme.com"));
    }

    #[test]
    fn assistants_normalize_with_tool_permissions() {
        let item = json!({
            "id": "asst_42",
            "name": "Support Triage",
            "model": "gpt-4o",
            "tools": [{"type": "file_search"}, {"type": "code_interpreter"}]
        });
        let assistant = normalize_assistant(&item).unwrap();
        assert_eq!(assistant.automation_type, AutomationType::Bot);
        assert_eq!(assistant.permissions, vec!["file_search", "code_interpreter"]);
    }

    #[test]
    fn audit_entries_attribute_service_accounts() {
        let item = json!({
            "type": "api_key.created",
            "effective_at": 1719834000,
            "actor": {"api_key": {"id": "key_1", "service_account": {"id": "svc_acct_1"}}},
            "project": {"name": "prod"}
        });
        let event = normalize_audit_entry(&item).unwrap();
        assert_eq!(event.event_type, "api_key.created");
        assert_eq!(event.automation_external_id.as_deref(), Some("svc_acct_1"));
        assert_eq!(event.target.as_deref(), Some("prod"));
    }

    #[test]
    fn provider_selects_base_url() {
        let oauth = OAuthClientConfig::default();
        let chatgpt = AiPlatformConnector::new(Platform::Chatgpt, oauth.clone());
        let claude = AiPlatformConnector::new(Platform::Claude, oauth.clone());
        let gemini = AiPlatformConnector::new(Platform::Gemini, oauth);
        assert!(chatgpt.base_url.contains("openai"));
        assert!(claude.base_url.contains("anthropic"));
        assert!(gemini.base_url.contains("googleapis"));
    }
}
