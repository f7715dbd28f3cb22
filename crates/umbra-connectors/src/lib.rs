//! Umbra platform connectors
//!
//! One adapter per platform translates that platform's APIs into a uniform
//! discovery stream of normalized automations and activity events. Adapters
//! expose capability flags so the engine schedules only what a platform
//! supports, and a rate-limit budget the engine treats as a token bucket.

pub mod ai_platform;
pub mod google;
pub mod microsoft;
pub mod mock;
pub mod oauth;
pub mod ratelimit;
pub mod slack;

pub use mock::MockConnector;
pub use ratelimit::RateLimiter;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use umbra_core::types::{DiscoveryItem, OAuthCredentials, Platform};
use umbra_core::UmbraError;

/// Capability flags per adapter; drives scheduling decisions
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub discover_automations: bool,
    pub list_users: bool,
    pub fetch_audit_events: bool,
    pub validate_token: bool,
}

/// Result of a code exchange: credentials plus the authorizing identity
#[derive(Debug, Clone)]
pub struct ExchangedCredentials {
    pub credentials: OAuthCredentials,
    pub platform_user_id: String,
    pub display_name: Option<String>,
    /// Workspace metadata as returned by the platform (opaque)
    pub workspace: serde_json::Value,
}

/// Outcome of a token probe
#[derive(Debug, Clone)]
pub struct TokenProbe {
    pub valid: bool,
    pub latency_ms: f64,
    pub detail: Option<String>,
}

/// Inputs to a discovery stream
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    pub credentials: OAuthCredentials,
    /// Resume point when the platform's pagination is stable
    pub cursor: Option<String>,
}

/// Connector failure taxonomy; maps onto the platform error tags
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("upstream rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("malformed platform response: {0}")]
    Decode(String),
    #[error("capability not supported: {0}")]
    Unsupported(&'static str),
}

impl ConnectorError {
    /// Transient failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::RateLimited { .. } | ConnectorError::Unavailable(_))
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        ConnectorError::Unavailable(err.to_string())
    }
}

impl From<ConnectorError> for UmbraError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::RateLimited { retry_after_secs } => {
                UmbraError::UpstreamRateLimited { retry_after_secs }
            }
            ConnectorError::Unavailable(reason) => UmbraError::UpstreamUnavailable { reason },
            ConnectorError::InvalidGrant(reason) => UmbraError::InvalidGrant { reason },
            ConnectorError::PermissionDenied(operation) => {
                UmbraError::PermissionDenied { operation }
            }
            ConnectorError::Decode(reason) => UmbraError::UpstreamUnavailable { reason },
            ConnectorError::Unsupported(capability) => UmbraError::ValidationFailed {
                field: "capability".to_string(),
                reason: capability.to_string(),
            },
        }
    }
}

/// Map an HTTP status onto the connector taxonomy. `retry_after` comes from
/// the platform's Retry-After header when present.
pub fn classify_status(status: reqwest::StatusCode, retry_after: Option<u64>) -> Option<ConnectorError> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        401 => ConnectorError::InvalidGrant("token rejected by platform".to_string()),
        403 => ConnectorError::PermissionDenied("platform scope missing".to_string()),
        429 => ConnectorError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(30),
        },
        s if s >= 500 => ConnectorError::Unavailable(format!("platform returned {s}")),
        s => ConnectorError::Unavailable(format!("unexpected status {s}")),
    })
}

/// Read a Retry-After header as whole seconds
pub fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// A lazy, finite, non-restartable sequence of discovery items.
///
/// The producer task is cancelled when the stream is closed or dropped;
/// the engine owns the stream's lifetime.
pub struct DiscoveryStream {
    rx: mpsc::Receiver<Result<DiscoveryItem, ConnectorError>>,
    cancel: CancellationToken,
    closed: bool,
}

/// Depth of the producer channel; reads pausing past this suspend the adapter
pub const STREAM_BUFFER: usize = 64;

impl DiscoveryStream {
    /// Wire up a stream; the producer should send on `tx` and stop when
    /// `cancel` fires
    pub fn channel() -> (
        mpsc::Sender<Result<DiscoveryItem, ConnectorError>>,
        CancellationToken,
        Self,
    ) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = CancellationToken::new();
        let stream = Self {
            rx,
            cancel: cancel.clone(),
            closed: false,
        };
        (tx, cancel, stream)
    }

    /// Next item, or `None` once the sequence is exhausted or closed
    pub async fn next(&mut self) -> Option<Result<DiscoveryItem, ConnectorError>> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop the producer and drain nothing further
    pub fn close(&mut self) {
        self.closed = true;
        self.cancel.cancel();
        self.rx.close();
    }
}

impl Drop for DiscoveryStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Uniform adapter contract
#[async_trait]
pub trait Connector: Send + Sync {
    fn platform(&self) -> Platform;
    fn capabilities(&self) -> Capabilities;
    fn rate_limiter(&self) -> &RateLimiter;

    /// OAuth step 1: redirect URL carrying the signed state
    fn build_authorization_url(&self, state: &str) -> String;

    /// OAuth step 2: exchange the callback code for credentials + identity
    async fn exchange_code(&self, code: &str) -> Result<ExchangedCredentials, ConnectorError>;

    /// Refresh credentials. Idempotent on non-network failure; preserves the
    /// refresh token when the platform does not reissue one.
    async fn refresh(&self, creds: &OAuthCredentials) -> Result<OAuthCredentials, ConnectorError>;

    /// Revoke the grant upstream; true when the platform confirmed it
    async fn revoke(&self, creds: &OAuthCredentials) -> Result<bool, ConnectorError>;

    /// Cheap token probe used by health checks
    async fn validate_token(&self, creds: &OAuthCredentials) -> Result<TokenProbe, ConnectorError>;

    /// Start the discovery stream for one run
    async fn discover(&self, ctx: DiscoveryContext) -> Result<DiscoveryStream, ConnectorError>;
}

/// Retry a transient-prone operation with capped exponential backoff.
/// Rate-limit responses honor the platform's retry-after hint.
pub async fn with_backoff<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    mut f: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ConnectorError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = match &err {
                    ConnectorError::RateLimited { retry_after_secs } => {
                        Duration::from_secs((*retry_after_secs).min(60))
                    }
                    _ => Duration::from_millis(250 * 2u64.pow(attempt.min(6))),
                };
                tracing::warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(classify_status(reqwest::StatusCode::OK, None).is_none());
        assert!(matches!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED, None),
            Some(ConnectorError::InvalidGrant(_))
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(12)),
            Some(ConnectorError::RateLimited { retry_after_secs: 12 })
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY, None),
            Some(ConnectorError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", 4, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ConnectorError::Unavailable("flaky".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConnectorError::InvalidGrant("revoked".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ConnectorError::InvalidGrant(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_stream_yields_nothing_and_cancels_producer() {
        let (tx, cancel, mut stream) = DiscoveryStream::channel();
        tx.send(Ok(DiscoveryItem::Activity(umbra_core::types::NormalizedActivity {
            automation_external_id: None,
            actor_id: "bot".to_string(),
            event_type: "message".to_string(),
            target: None,
            bytes: None,
            records: None,
            occurred_at: chrono::Utc::now(),
        })))
        .await
        .unwrap();

        stream.close();
        assert!(cancel.is_cancelled());
        assert!(stream.next().await.is_none());
    }
}
