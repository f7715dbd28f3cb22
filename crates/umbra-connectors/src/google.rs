//! Google Workspace connector
//!
//! Enumerates third-party OAuth grants through the Admin SDK Directory
//! tokens API and reads token-activity audit events from the Reports API.
//! Requires the `admin.directory.user.readonly` and
//! `admin.reports.audit.readonly` scopes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use umbra_core::config::OAuthClientConfig;
use umbra_core::types::*;
use umbra_core::vendor::extract_vendor_name;

use crate::{
    classify_status, retry_after_secs, with_backoff, Capabilities, Connector, ConnectorError,
    DiscoveryContext, DiscoveryStream, ExchangedCredentials, RateLimiter, TokenProbe,
};

/// Admin SDK default quota is ~2400 queries/minute per user
const GOOGLE_BUCKET: u32 = 100;
const GOOGLE_REFILL_PER_SEC: f64 = 40.0;
/// Directory page fetch cap per run
const MAX_USER_PAGES: u32 = 20;

pub struct GoogleConnector {
    http: reqwest::Client,
    auth_base: String,
    api_base: String,
    oauth: OAuthClientConfig,
    limiter: Arc<RateLimiter>,
}

impl GoogleConnector {
    pub fn new(oauth: OAuthClientConfig) -> Self {
        Self::with_base_urls(
            oauth,
            "https://accounts.google.com".to_string(),
            "https://www.googleapis.com".to_string(),
        )
    }

    /// Base URL overrides for tests
    pub fn with_base_urls(oauth: OAuthClientConfig, auth_base: String, api_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_base,
            api_base,
            oauth,
            limiter: Arc::new(RateLimiter::new(GOOGLE_BUCKET, GOOGLE_REFILL_PER_SEC)),
        }
    }

    async fn api_get(
        http: &reqwest::Client,
        token: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ConnectorError> {
        let response = http.get(url).bearer_auth(token).query(query).send().await?;
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

/// Normalize one Directory `tokens.list` item into an OAuth-app automation
pub fn normalize_token_grant(user_email: &str, item: &Value) -> Option<NormalizedAutomation> {
    let client_id = item.get("clientId")?.as_str()?.to_string();
    let display = item
        .get("displayText")
        .and_then(Value::as_str)
        .unwrap_or(&client_id)
        .to_string();
    let scopes: Vec<String> = item
        .get("scopes")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(NormalizedAutomation {
        external_id: client_id,
        automation_type: AutomationType::OauthApp,
        name: display.clone(),
        platform_metadata: item.clone(),
        permissions: scopes,
        owner: Some(user_email.to_string()),
        vendor_name: extract_vendor_name(&display),
    })
}

/// Flatten a Reports API activity record into normalized activity events
pub fn normalize_token_activity(record: &Value) -> Vec<NormalizedActivity> {
    let occurred_at: DateTime<Utc> = record
        .pointer("/id/time")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Utc::now);
    let actor = record
        .pointer("/actor/email")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    record
        .get("events")
        .and_then(Value::as_array)
        .map(|events| {
            events
                .iter()
                .map(|event| {
                    let name = event.get("name").and_then(Value::as_str).unwrap_or("token_event");
                    let parameters = event.get("parameters").and_then(Value::as_array);
                    let param = |key: &str| {
                        parameters.and_then(|ps| {
                            ps.iter()
                                .find(|p| p.get("name").and_then(Value::as_str) == Some(key))
                                .and_then(|p| p.get("value"))
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                    };
                    NormalizedActivity {
                        automation_external_id: param("client_id"),
                        actor_id: actor.clone(),
                        event_type: format!("token.{name}"),
                        target: param("app_name"),
                        bytes: None,
                        records: None,
                        occurred_at,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

fn token_response_to_creds(
    body: &Value,
    prior: Option<&OAuthCredentials>,
) -> Result<OAuthCredentials, ConnectorError> {
    let access_token = body
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::Decode("missing access_token".to_string()))?
        .to_string();
    // Google only issues the refresh token on first consent; keep ours
    let refresh_token = body
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| prior.and_then(|p| p.refresh_token.clone()));
    let scopes = body
        .get("scope")
        .and_then(Value::as_str)
        .map(|s| s.split(' ').map(str::to_string).collect())
        .or_else(|| prior.map(|p| p.scopes.clone()))
        .unwrap_or_default();
    Ok(OAuthCredentials {
        access_token,
        refresh_token,
        scopes,
        expires_at: body
            .get("expires_in")
            .and_then(Value::as_i64)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
    })
}

#[async_trait]
impl Connector for GoogleConnector {
    fn platform(&self) -> Platform {
        Platform::Google
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
            "{}/o/oauth2/v2/auth?client_id={}&response_type=code&access_type=offline&prompt=consent\
             &scope=https://www.googleapis.com/auth/admin.directory.user.readonly%20https://www.googleapis.com/auth/admin.reports.audit.readonly\
             &state={}&redirect_uri={}",
            self.auth_base, self.oauth.client_id, state, self.oauth.redirect_uri
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ExchangedCredentials, ConnectorError> {
        self.limiter.acquire().await;
        let response = self
            .http
            .post(format!("{}/o/oauth2/token", self.auth_base))
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
        let credentials = token_response_to_creds(&body, None)?;

        let userinfo = Self::api_get(
            &self.http,
            &credentials.access_token,
            &format!("{}/oauth2/v2/userinfo", self.api_base),
            &[],
        )
        .await?;
        let platform_user_id = userinfo
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Decode("missing user id".to_string()))?
            .to_string();

        Ok(ExchangedCredentials {
            credentials,
            platform_user_id,
            display_name: userinfo.get("email").and_then(Value::as_str).map(str::to_string),
            workspace: userinfo,
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
            .post(format!("{}/o/oauth2/token", self.auth_base))
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
            // invalid_grant comes back as 400
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let code = body.get("error").and_then(Value::as_str).unwrap_or("invalid_grant");
            return Err(ConnectorError::InvalidGrant(code.to_string()));
        }
        if let Some(err) = classify_status(status, None) {
            return Err(err);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        token_response_to_creds(&body, Some(creds))
    }

    async fn revoke(&self, creds: &OAuthCredentials) -> Result<bool, ConnectorError> {
        self.limiter.acquire().await;
        let response = self
            .http
            .post(format!("{}/o/oauth2/revoke", self.auth_base))
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
            &format!("{}/oauth2/v2/userinfo", self.api_base),
            &[],
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
        let api_base = self.api_base.clone();
        let limiter = self.limiter.clone();
        let token = ctx.credentials.access_token.clone();
        let mut page_token = ctx.cursor;

        tokio::spawn(async move {
            // Phase 1: users, then each user's third-party token grants
            let mut pages = 0u32;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                limiter.acquire().await;
                let users_url = format!("{api_base}/admin/directory/v1/users");
                let page_param = page_token.clone().unwrap_or_default();
                let query = [
                    ("customer", "my_customer"),
                    ("maxResults", "100"),
                    ("pageToken", page_param.as_str()),
                ];
                let page = match with_backoff("google.users.list", 3, || {
                    Self::api_get(&http, &token, &users_url, &query)
                })
                .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };

                for user in page
                    .get("users")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
                {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let Some(email) = user.get("primaryEmail").and_then(Value::as_str) else {
                        continue;
                    };
                    limiter.acquire().await;
                    let tokens_url =
                        format!("{api_base}/admin/directory/v1/users/{email}/tokens");
                    let grants = match with_backoff("google.tokens.list", 3, || {
                        Self::api_get(&http, &token, &tokens_url, &[])
                    })
                    .await
                    {
                        Ok(body) => body,
                        Err(err) => {
                            // Per-resource: record and keep walking users
                            let fatal = matches!(err, ConnectorError::InvalidGrant(_));
                            let _ = tx.send(Err(err)).await;
                            if fatal {
                                return;
                            }
                            continue;
                        }
                    };
                    for item in grants
                        .get("items")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                    {
                        if let Some(grant) = normalize_token_grant(email, item) {
                            if tx.send(Ok(DiscoveryItem::Automation(grant))).await.is_err() {
                                return;
                            }
                        }
                    }
                }

                page_token = page
                    .get("nextPageToken")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                pages += 1;
                if page_token.is_none() || pages >= MAX_USER_PAGES {
                    break;
                }
            }

            // Phase 2: token audit activity
            if cancel.is_cancelled() {
                return;
            }
            limiter.acquire().await;
            let audit_url =
                format!("{api_base}/admin/reports/v1/activity/users/all/applications/token");
            let query = [("maxResults", "200")];
            match with_backoff("google.reports.token", 3, || {
                Self::api_get(&http, &token, &audit_url, &query)
            })
            .await
            {
                Ok(body) => {
                    for record in body
                        .get("items")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                    {
                        for event in normalize_token_activity(record) {
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
    fn token_grants_normalize_with_owner_and_scopes() {
        let item = json!({
            "clientId": "7777.apps.googleusercontent.com",
            "displayText": "Attio CRM",
            "scopes": ["https://www.googleapis.com/auth/contacts", "openid"],
            "anonymous": false
        });
        let grant = normalize_token_grant("jane@acme.com", &item).unwrap();
        assert_eq!(grant.external_id, "7777.apps.googleusercontent.com");
        assert_eq!(grant.automation_type, AutomationType::OauthApp);
        assert_eq!(grant.permissions.len(), 2);
        assert_eq!(grant.owner.as_deref(), Some("jane@acme.com"));
        assert_eq!(grant.vendor_name.as_deref(), Some("Attio"));
    }

    #[test]
    fn grants_without_client_id_are_skipped() {
        assert!(normalize_token_grant("a@b.c", &json!({"displayText": "x"})).is_none());
    }

    #[test]
    fn activity_records_flatten_per_event() {
        let record = json!({
            "id": {"time": "2026-07-01T12:00:00Z"},
            "actor": {"email": "svc@acme.com"},
            "events": [
                {"name": "authorize", "parameters": [
                    {"name": "client_id", "value": "7777"},
                    {"name": "app_name", "value": "Attio"}
                ]},
                {"name": "revoke", "parameters": [
                    {"name": "client_id", "value": "8888"}
                ]}
            ]
        });
        let events = normalize_token_activity(&record);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "token.authorize");
        assert_eq!(events[0].automation_external_id.as_deref(), Some("7777"));
        assert_eq!(events[0].target.as_deref(), Some("Attio"));
        assert_eq!(events[1].event_type, "token.revoke");
    }

    #[test]
    fn refresh_preserves_prior_refresh_token() {
        let prior = OAuthCredentials {
            access_token: "old".to_string(),
            refresh_token: Some("keep-me".to_string()),
            scopes: vec!["admin.directory.user.readonly".to_string()],
            expires_at: None,
        };
        let body = json!({"access_token": "new", "expires_in": 3600});
        let refreshed = token_response_to_creds(&body, Some(&prior)).unwrap();
        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("keep-me"));
        assert_eq!(refreshed.scopes, prior.scopes);
        assert!(refreshed.expires_at.is_some());
    }
}
