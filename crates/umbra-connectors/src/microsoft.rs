//! Microsoft 365 connector
//!
//! Enumerates service principals and Graph webhooks, and reads directory
//! audit entries for activity. Requires the `Application.Read.All` and
//! `AuditLog.Read.All` Graph scopes.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use umbra_core::config::OAuthClientConfig;
use umbra_core::types::*;
use umbra_core::vendor::extract_vendor_name;

use crate::{
    classify_status, retry_after_secs, with_backoff, Capabilities, Connector, ConnectorError,
    DiscoveryContext, DiscoveryStream, ExchangedCredentials, RateLimiter, TokenProbe,
};

/// Graph throttles around 2000 requests per 10 minutes per app
const GRAPH_BUCKET: u32 = 60;
const GRAPH_REFILL_PER_SEC: f64 = 3.0;
/// Pagination cap per collection
const MAX_PAGES: u32 = 20;

pub struct MicrosoftConnector {
    http: reqwest::Client,
    login_base: String,
    graph_base: String,
    oauth: OAuthClientConfig,
    limiter: Arc<RateLimiter>,
}

impl MicrosoftConnector {
    pub fn new(oauth: OAuthClientConfig) -> Self {
        Self::with_base_urls(
            oauth,
            "https://login.microsoftonline.com".to_string(),
            "https://graph.microsoft.com".to_string(),
        )
    }

    /// Base URL overrides for tests
    pub fn with_base_urls(oauth: OAuthClientConfig, login_base: String, graph_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            login_base,
            graph_base,
            oauth,
            limiter: Arc::new(RateLimiter::new(GRAPH_BUCKET, GRAPH_REFILL_PER_SEC)),
        }
    }

    async fn graph_get(
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

/// Normalize a Graph service principal into an automation
pub fn normalize_service_principal(sp: &Value) -> Option<NormalizedAutomation> {
    let id = sp.get("appId").or_else(|| sp.get("id"))?.as_str()?.to_string();
    let name = sp
        .get("displayName")
        .and_then(Value::as_str)
        .unwrap_or("unnamed application")
        .to_string();
    let automation_type = match sp.get("servicePrincipalType").and_then(Value::as_str) {
        Some("ManagedIdentity") => AutomationType::ServiceAccount,
        _ => AutomationType::OauthApp,
    };
    let permissions: Vec<String> = sp
        .get("oauth2PermissionScopes")
        .or_else(|| sp.get("publishedPermissionScopes"))
        .and_then(Value::as_array)
        .map(|scopes| {
            scopes
                .iter()
                .filter_map(|s| s.get("value").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(NormalizedAutomation {
        external_id: id,
        automation_type,
        name: name.clone(),
        platform_metadata: sp.clone(),
        permissions,
        owner: sp
            .get("appOwnerOrganizationId")
            .and_then(Value::as_str)
            .map(str::to_string),
        vendor_name: extract_vendor_name(&name),
    })
}

/// Normalize a Graph change-notification subscription into a webhook
pub fn normalize_subscription(sub: &Value) -> Option<NormalizedAutomation> {
    let id = sub.get("id")?.as_str()?.to_string();
    let resource = sub
        .get("resource")
        .and_then(Value::as_str)
        .unwrap_or("unknown resource");
    let name = format!("Graph webhook on {resource}");
    Some(NormalizedAutomation {
        external_id: format!("subscription:{id}"),
        automation_type: AutomationType::Webhook,
        name,
        platform_metadata: sub.clone(),
        permissions: vec![],
        owner: sub
            .get("creatorId")
            .and_then(Value::as_str)
            .map(str::to_string),
        // Webhook callback hosts rarely carry a vendor display name
        vendor_name: sub
            .get("notificationUrl")
            .and_then(Value::as_str)
            .and_then(|url| url.strip_prefix("https://"))
            .and_then(|host| host.split('/').next())
            .and_then(extract_vendor_name),
    })
}

/// Normalize a directory audit entry into an activity event
pub fn normalize_directory_audit(entry: &Value) -> Option<NormalizedActivity> {
    let occurred_at = entry
        .get("activityDateTime")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Utc::now);
    let actor = entry
        .pointer("/initiatedBy/app/appId")
        .or_else(|| entry.pointer("/initiatedBy/user/id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let automation_external_id = entry
        .pointer("/initiatedBy/app/appId")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(NormalizedActivity {
        automation_external_id,
        actor_id: actor,
        event_type: entry
            .get("activityDisplayName")
            .and_then(Value::as_str)
            .unwrap_or("directory_audit")
            .to_string(),
        target: entry
            .pointer("/targetResources/0/displayName")
            .and_then(Value::as_str)
            .map(str::to_string),
        bytes: None,
        records: None,
        occurred_at,
    })
}

#[async_trait]
impl Connector for MicrosoftConnector {
    fn platform(&self) -> Platform {
        Platform::Microsoft
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
        format!(
            "{}/common/oauth2/v2.0/authorize?client_id={}&response_type=code\
             &scope=offline_access%20Application.Read.All%20AuditLog.Read.All\
             &state={}&redirect_uri={}",
            self.login_base, self.oauth.client_id, state, self.oauth.redirect_uri
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ExchangedCredentials, ConnectorError> {
        self.limiter.acquire().await;
        let response = self
            .http
            .post(format!("{}/common/oauth2/v2.0/token", self.login_base))
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
        let credentials = ms_token_to_creds(&body, None)?;

        let me = Self::graph_get(
            &self.http,
            &credentials.access_token,
            &format!("{}/v1.0/me", self.graph_base),
        )
        .await?;
        let platform_user_id = me
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Decode("missing user id".to_string()))?
            .to_string();

        Ok(ExchangedCredentials {
            credentials,
            platform_user_id,
            display_name: me
                .get("userPrincipalName")
                .and_then(Value::as_str)
                .map(str::to_string),
            workspace: me,
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
            .post(format!("{}/common/oauth2/v2.0/token", self.login_base))
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
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let code = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("invalid_grant");
            return Err(ConnectorError::InvalidGrant(code.to_string()));
        }
        if let Some(err) = classify_status(status, None) {
            return Err(err);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        ms_token_to_creds(&body, Some(creds))
    }

    async fn revoke(&self, _creds: &OAuthCredentials) -> Result<bool, ConnectorError> {
        // Graph has no self-service token revocation endpoint; the grant is
        // removed tenant-side. Report unconfirmed.
        Ok(false)
    }

    async fn validate_token(&self, creds: &OAuthCredentials) -> Result<TokenProbe, ConnectorError> {
        self.limiter.acquire().await;
        let start = std::time::Instant::now();
        let result = Self::graph_get(
            &self.http,
            &creds.access_token,
            &format!("{}/v1.0/me", self.graph_base),
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
        let graph_base = self.graph_base.clone();
        let limiter = self.limiter.clone();
        let token = ctx.credentials.access_token.clone();
        let start_url = ctx
            .cursor
            .unwrap_or_else(|| format!("{graph_base}/v1.0/servicePrincipals?$top=100"));

        tokio::spawn(async move {
            // Phase 1: service principals, nextLink-paginated
            let mut url = Some(start_url);
            let mut pages = 0u32;
            while let Some(current) = url.take() {
                if cancel.is_cancelled() {
                    return;
                }
                limiter.acquire().await;
                let page = match with_backoff("graph.servicePrincipals", 3, || {
                    Self::graph_get(&http, &token, &current)
                })
                .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                for sp in page
                    .get("value")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
                {
                    if let Some(automation) = normalize_service_principal(sp) {
                        if tx.send(Ok(DiscoveryItem::Automation(automation))).await.is_err() {
                            return;
                        }
                    }
                }
                pages += 1;
                url = page
                    .get("@odata.nextLink")
                    .and_then(Value::as_str)
                    .filter(|_| pages < MAX_PAGES)
                    .map(str::to_string);
            }

            // Phase 2: webhook subscriptions
            if cancel.is_cancelled() {
                return;
            }
            limiter.acquire().await;
            let subscriptions_url = format!("{graph_base}/v1.0/subscriptions");
            match with_backoff("graph.subscriptions", 3, || {
                Self::graph_get(&http, &token, &subscriptions_url)
            })
            .await
            {
                Ok(page) => {
                    for sub in page
                        .get("value")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                    {
                        if let Some(webhook) = normalize_subscription(sub) {
                            if tx.send(Ok(DiscoveryItem::Automation(webhook))).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }

            // Phase 3: directory audit activity
            if cancel.is_cancelled() {
                return;
            }
            limiter.acquire().await;
            let directory_audits_url = format!("{graph_base}/v1.0/auditLogs/directoryAudits?$top=50");
            match with_backoff("graph.directoryAudits", 3, || {
                Self::graph_get(&http, &token, &directory_audits_url)
            })
            .await
            {
                Ok(page) => {
                    for entry in page
                        .get("value")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                    {
                        if let Some(event) = normalize_directory_audit(entry) {
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

fn ms_token_to_creds(
    body: &Value,
    prior: Option<&OAuthCredentials>,
) -> Result<OAuthCredentials, ConnectorError> {
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
            .or_else(|| prior.and_then(|p| p.refresh_token.clone())),
        scopes: body
            .get("scope")
            .and_then(Value::as_str)
            .map(|s| s.split(' ').map(str::to_string).collect())
            .or_else(|| prior.map(|p| p.scopes.clone()))
            .unwrap_or_default(),
        expires_at: body
            .get("expires_in")
            .and_then(Value::as_i64)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_principals_normalize_by_type() {
        let app = json!({
            "appId": "abc-123",
            "displayName": "Zapier OAuth",
            "servicePrincipalType": "Application",
            "oauth2PermissionScopes": [{"value": "Mail.Read"}, {"value": "User.Read"}]
        });
        let normalized = normalize_service_principal(&app).unwrap();
        assert_eq!(normalized.automation_type, AutomationType::OauthApp);
        assert_eq!(normalized.permissions, vec!["Mail.Read", "User.Read"]);
        assert_eq!(normalized.vendor_name.as_deref(), Some("Zapier"));

        let identity = json!({
            "appId": "def-456",
            "displayName": "build-pipeline-identity",
            "servicePrincipalType": "ManagedIdentity"
        });
        let normalized = normalize_service_principal(&identity).unwrap();
        assert_eq!(normalized.automation_type, AutomationType::ServiceAccount);
    }

    #[test]
    fn subscriptions_become_webhooks() {
        let sub = json!({
            "id": "sub-1",
            "resource": "users/{id}/messages",
            "notificationUrl": "https://hooks.attio.com/graph",
            "creatorId": "user-9"
        });
        let webhook = normalize_subscription(&sub).unwrap();
        assert_eq!(webhook.external_id, "subscription:sub-1");
        assert_eq!(webhook.automation_type, AutomationType::Webhook);
        assert_eq!(webhook.owner.as_deref(), Some("user-9"));
    }

    #[test]
    fn audit_entries_become_activity() {
        let entry = json!({
            "activityDateTime": "2026-07-01T09:30:00Z",
            "activityDisplayName": "Consent to application",
            "initiatedBy": {"app": {"appId": "abc-123"}},
            "targetResources": [{"displayName": "Attio"}]
        });
        let event = normalize_directory_audit(&entry).unwrap();
        assert_eq!(event.event_type, "Consent to application");
        assert_eq!(event.automation_external_id.as_deref(), Some("abc-123"));
        assert_eq!(event.target.as_deref(), Some("Attio"));
    }

    #[test]
    fn refresh_response_preserves_prior_token_fields() {
        let prior = OAuthCredentials {
            access_token: "old".to_string(),
            refresh_token: Some("rt".to_string()),
            scopes: vec!["Application.Read.All".to_string()],
            expires_at: None,
        };
        let body = json!({"access_token": "new", "expires_in": 3599});
        let creds = ms_token_to_creds(&body, Some(&prior)).unwrap();
        assert_eq!(creds.refresh_token.as_deref(), Some("rt"));
        assert_eq!(creds.scopes, prior.scopes);
    }
}
