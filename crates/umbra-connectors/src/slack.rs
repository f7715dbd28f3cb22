//! Slack connector
//!
//! Discovers bot users and installed apps through the Slack Web API and
//! turns integration-log entries into activity events. Requires the
//! `users:read`, `team:read`, and `admin` bot scopes.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use umbra_core::config::OAuthClientConfig;
use umbra_core::types::*;
use umbra_core::vendor::extract_vendor_name;

use crate::{
    classify_status, retry_after_secs, with_backoff, Capabilities, Connector, ConnectorError,
    DiscoveryContext, DiscoveryStream, ExchangedCredentials, RateLimiter, TokenProbe,
};

/// Slack Web API tier-3 methods allow ~50 requests per minute
const SLACK_BUCKET: u32 = 50;
const SLACK_REFILL_PER_SEC: f64 = 50.0 / 60.0;
/// Integration-log pages fetched per run
const MAX_LOG_PAGES: u32 = 10;

pub struct SlackConnector {
    http: reqwest::Client,
    base_url: String,
    oauth: OAuthClientConfig,
    limiter: Arc<RateLimiter>,
}

impl SlackConnector {
    pub fn new(oauth: OAuthClientConfig) -> Self {
        Self::with_base_url(oauth, "https://slack.com".to_string())
    }

    /// Base URL override for tests
    pub fn with_base_url(oauth: OAuthClientConfig, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            oauth,
            limiter: Arc::new(RateLimiter::new(SLACK_BUCKET, SLACK_REFILL_PER_SEC)),
        }
    }

    async fn api_get(
        http: &reqwest::Client,
        base_url: &str,
        token: &str,
        method: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ConnectorError> {
        let response = http
            .get(format!("{base_url}/api/{method}"))
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        let retry = retry_after_secs(response.headers());
        if let Some(err) = classify_status(response.status(), retry) {
            return Err(err);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        slack_ok(&body)?;
        Ok(body)
    }
}

/// Slack reports most failures as `{"ok": false, "error": "..."}` with HTTP 200
fn slack_ok(body: &Value) -> Result<(), ConnectorError> {
    if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(());
    }
    let code = body.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
    Err(match code {
        "invalid_auth" | "token_revoked" | "token_expired" | "account_inactive" => {
            ConnectorError::InvalidGrant(code.to_string())
        }
        "ratelimited" | "rate_limited" => ConnectorError::RateLimited { retry_after_secs: 30 },
        "missing_scope" | "not_allowed_token_type" => {
            ConnectorError::PermissionDenied(code.to_string())
        }
        other => ConnectorError::Unavailable(format!("slack error: {other}")),
    })
}

/// Normalize a `users.list` member into an automation when it is a bot
pub fn normalize_bot(member: &Value) -> Option<NormalizedAutomation> {
    if !member.get("is_bot").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let id = member.get("id")?.as_str()?.to_string();
    let profile = member.get("profile").cloned().unwrap_or(Value::Null);
    let name = profile
        .get("real_name")
        .and_then(Value::as_str)
        .or_else(|| member.get("name").and_then(Value::as_str))
        .unwrap_or("unnamed bot")
        .to_string();
    Some(NormalizedAutomation {
        external_id: id,
        automation_type: AutomationType::Bot,
        name: name.clone(),
        platform_metadata: member.clone(),
        permissions: vec![],
        owner: profile
            .get("bot_owner")
            .and_then(Value::as_str)
            .map(str::to_string),
        vendor_name: extract_vendor_name(&name),
    })
}

/// Expand a `team.integrationLogs` entry into discovery items: an app
/// install becomes an automation, every entry becomes an activity event
pub fn normalize_integration_log(entry: &Value) -> Vec<DiscoveryItem> {
    let mut items = Vec::new();
    let occurred_at = entry
        .get("date")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);
    let app_id = entry.get("app_id").and_then(Value::as_str);
    let change_type = entry
        .get("change_type")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    if change_type == "added" {
        if let Some(app_id) = app_id {
            let name = entry
                .get("app_type")
                .and_then(Value::as_str)
                .unwrap_or("Slack App")
                .to_string();
            let scopes: Vec<String> = entry
                .get("scope")
                .and_then(Value::as_str)
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            items.push(DiscoveryItem::Automation(NormalizedAutomation {
                external_id: app_id.to_string(),
                automation_type: AutomationType::OauthApp,
                name: name.clone(),
                platform_metadata: entry.clone(),
                permissions: scopes,
                owner: entry.get("user_id").and_then(Value::as_str).map(str::to_string),
                vendor_name: extract_vendor_name(&name),
            }));
        }
    }

    items.push(DiscoveryItem::Activity(NormalizedActivity {
        automation_external_id: app_id.map(str::to_string),
        actor_id: entry
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        event_type: format!("integration.{change_type}"),
        target: entry.get("channel").and_then(Value::as_str).map(str::to_string),
        bytes: None,
        records: None,
        occurred_at,
    }));
    items
}

fn parse_expiry(body: &Value) -> Option<DateTime<Utc>> {
    body.get("expires_in")
        .and_then(Value::as_i64)
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
}

fn parse_scopes(body: &Value) -> Vec<String> {
    body.get("scope")
        .and_then(Value::as_str)
        .map(|s| s.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

#[async_trait]
impl Connector for SlackConnector {
    fn platform(&self) -> Platform {
        Platform::Slack
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
            "{}/oauth/v2/authorize?client_id={}&scope=users:read,team:read,admin&state={}&redirect_uri={}",
            self.base_url, self.oauth.client_id, state, self.oauth.redirect_uri
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ExchangedCredentials, ConnectorError> {
        self.limiter.acquire().await;
        let response = self
            .http
            .post(format!("{}/api/oauth.v2.access", self.base_url))
            .form(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("code", code),
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
        slack_ok(&body)?;

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Decode("missing access_token".to_string()))?
            .to_string();
        let platform_user_id = body
            .pointer("/authed_user/id")
            .or_else(|| body.pointer("/bot_user_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Decode("missing authed user".to_string()))?
            .to_string();
        let workspace = body.get("team").cloned().unwrap_or(Value::Null);
        let display_name = workspace
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(ExchangedCredentials {
            credentials: OAuthCredentials {
                access_token,
                refresh_token: body
                    .get("refresh_token")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                scopes: parse_scopes(&body),
                expires_at: parse_expiry(&body),
            },
            platform_user_id,
            display_name,
            workspace,
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
            .post(format!("{}/api/oauth.v2.access", self.base_url))
            .form(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
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
        slack_ok(&body)?;

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Decode("missing access_token".to_string()))?
            .to_string();
        Ok(OAuthCredentials {
            access_token,
            // Slack rotates refresh tokens; keep the old one if none came back
            refresh_token: body
                .get("refresh_token")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| creds.refresh_token.clone()),
            scopes: {
                let scopes = parse_scopes(&body);
                if scopes.is_empty() {
                    creds.scopes.clone()
                } else {
                    scopes
                }
            },
            expires_at: parse_expiry(&body),
        })
    }

    async fn revoke(&self, creds: &OAuthCredentials) -> Result<bool, ConnectorError> {
        self.limiter.acquire().await;
        let body = Self::api_get(
            &self.http,
            &self.base_url,
            &creds.access_token,
            "auth.revoke",
            &[],
        )
        .await?;
        Ok(body.get("revoked").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn validate_token(&self, creds: &OAuthCredentials) -> Result<TokenProbe, ConnectorError> {
        self.limiter.acquire().await;
        let start = std::time::Instant::now();
        let result = Self::api_get(
            &self.http,
            &self.base_url,
            &creds.access_token,
            "auth.test",
            &[],
        )
        .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(_) => Ok(TokenProbe {
                valid: true,
                latency_ms,
                detail: None,
            }),
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
        let mut cursor = ctx.cursor;

        tokio::spawn(async move {
            // Phase 1: bot users, cursor-paginated
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                limiter.acquire().await;
                let cursor_param = cursor.clone().unwrap_or_default();
                let query = [("limit", "200"), ("cursor", cursor_param.as_str())];
                let page = with_backoff("slack.users.list", 3, || {
                    Self::api_get(&http, &base_url, &token, "users.list", &query)
                })
                .await;
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        let fatal = !err.is_transient();
                        let _ = tx.send(Err(err)).await;
                        if fatal {
                            return;
                        }
                        break;
                    }
                };

                for member in page
                    .get("members")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
                {
                    if let Some(bot) = normalize_bot(member) {
                        if tx.send(Ok(DiscoveryItem::Automation(bot))).await.is_err() {
                            return;
                        }
                    }
                }

                cursor = page
                    .pointer("/response_metadata/next_cursor")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string);
                if cursor.is_none() {
                    break;
                }
            }

            // Phase 2: integration logs, page-numbered
            for page_no in 1..=MAX_LOG_PAGES {
                if cancel.is_cancelled() {
                    return;
                }
                limiter.acquire().await;
                let page_param = page_no.to_string();
                let query = [("count", "100"), ("page", page_param.as_str())];
                let page = with_backoff("slack.team.integrationLogs", 3, || {
                    Self::api_get(&http, &base_url, &token, "team.integrationLogs", &query)
                })
                .await;
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };

                let logs = page.get("logs").and_then(Value::as_array).cloned().unwrap_or_default();
                if logs.is_empty() {
                    break;
                }
                for entry in &logs {
                    for item in normalize_integration_log(entry) {
                        if tx.send(Ok(item)).await.is_err() {
                            return;
                        }
                    }
                }

                let total_pages = page
                    .pointer("/paging/pages")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as u32;
                if page_no >= total_pages {
                    break;
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
    fn bot_members_normalize_with_vendor() {
        let member = json!({
            "id": "U042BOT",
            "name": "zapier",
            "is_bot": true,
            "profile": {"real_name": "Zapier for Slack", "bot_owner": "U1"}
        });
        let bot = normalize_bot(&member).unwrap();
        assert_eq!(bot.external_id, "U042BOT");
        assert_eq!(bot.automation_type, AutomationType::Bot);
        assert_eq!(bot.vendor_name.as_deref(), Some("Zapier"));
        assert_eq!(bot.owner.as_deref(), Some("U1"));
    }

    #[test]
    fn human_members_are_skipped() {
        let member = json!({"id": "U1", "name": "jane", "is_bot": false});
        assert!(normalize_bot(&member).is_none());
    }

    #[test]
    fn integration_log_install_yields_automation_and_activity() {
        let entry = json!({
            "app_id": "A99",
            "app_type": "Attio",
            "change_type": "added",
            "date": "1719834000",
            "user_id": "U7",
            "scope": "channels:read,chat:write"
        });
        let items = normalize_integration_log(&entry);
        assert_eq!(items.len(), 2);
        match &items[0] {
            DiscoveryItem::Automation(a) => {
                assert_eq!(a.external_id, "A99");
                assert_eq!(a.automation_type, AutomationType::OauthApp);
                assert_eq!(a.permissions.len(), 2);
                assert_eq!(a.vendor_name.as_deref(), Some("Attio"));
            }
            other => panic!("expected automation, got {other:?}"),
        }
        match &items[1] {
            DiscoveryItem::Activity(e) => {
                assert_eq!(e.event_type, "integration.added");
                assert_eq!(e.automation_external_id.as_deref(), Some("A99"));
            }
            other => panic!("expected activity, got {other:?}"),
        }
    }

    #[test]
    fn removal_log_yields_activity_only() {
        let entry = json!({
            "app_id": "A99",
            "change_type": "removed",
            "date": "1719834000",
            "user_id": "U7"
        });
        let items = normalize_integration_log(&entry);
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], DiscoveryItem::Activity(_)));
    }

    #[test]
    fn slack_error_codes_map_to_taxonomy() {
        assert!(slack_ok(&json!({"ok": true})).is_ok());
        assert!(matches!(
            slack_ok(&json!({"ok": false, "error": "token_revoked"})),
            Err(ConnectorError::InvalidGrant(_))
        ));
        assert!(matches!(
            slack_ok(&json!({"ok": false, "error": "ratelimited"})),
            Err(ConnectorError::RateLimited { .. })
        ));
        assert!(matches!(
            slack_ok(&json!({"ok": false, "error": "missing_scope"})),
            Err(ConnectorError::PermissionDenied(_))
        ));
    }

    #[test]
    fn authorization_url_carries_state() {
        let connector = SlackConnector::new(OAuthClientConfig {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://umbra.example/callback".to_string(),
        });
        let url = connector.build_authorization_url("signed-state");
        assert!(url.contains("state=signed-state"));
        assert!(url.contains("client_id=cid"));
        assert!(!url.contains("secret"));
    }
}
