//! Connection lifecycle management
//!
//! Owns the `PlatformConnection` state machine: OAuth completion, health
//! checks with back-off cadence, pre-expiry refresh with one in-flight
//! refresh per connection, and credential-block handling after a
//! decryption failure.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use umbra_connectors::oauth::{sign_state, verify_state, OAuthState};
use umbra_connectors::ConnectorError;
use umbra_core::types::*;
use umbra_core::{Result, UmbraError};
use umbra_store::{CredentialChange, Store};
use umbra_vault::{CredentialVault, VaultError};
use uuid::Uuid;

use crate::ConnectorRegistry;

/// Seconds before expiry at which a refresh fires
pub const REFRESH_LEAD_SECS: i64 = 300;

pub struct ConnectionManager {
    store: Store,
    vault: Arc<CredentialVault>,
    connectors: Arc<ConnectorRegistry>,
    /// HMAC key for the OAuth state round-trip
    state_secret: Vec<u8>,
    /// One in-flight refresh per connection; later callers await the first
    refresh_guards: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ConnectionManager {
    pub fn new(
        store: Store,
        vault: Arc<CredentialVault>,
        connectors: Arc<ConnectorRegistry>,
        state_secret: &str,
    ) -> Self {
        Self {
            store,
            vault,
            connectors,
            state_secret: state_secret.as_bytes().to_vec(),
            refresh_guards: DashMap::new(),
        }
    }

    fn connector(&self, platform: Platform) -> Result<Arc<dyn umbra_connectors::Connector>> {
        self.connectors
            .get(platform)
            .ok_or_else(|| UmbraError::not_found(format!("connector for {platform}")))
    }

    async fn audit(
        &self,
        organization_id: Uuid,
        event_type: AuditEventType,
        severity: Severity,
        actor: &str,
        resource: String,
        details: serde_json::Value,
    ) {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            organization_id,
            event_type,
            severity,
            actor: actor.to_string(),
            resource,
            details,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.audit.append(entry).await {
            tracing::error!(error = %err, "audit append failed");
        }
    }

    /// OAuth step 1: signed state plus the platform redirect URL. Platforms
    /// an organization has disabled in its settings are refused here.
    pub async fn begin_authorization(
        &self,
        organization_id: Uuid,
        platform: Platform,
    ) -> Result<(String, String)> {
        if let Some(org) = self.store.organizations.get(organization_id).await? {
            if !org.settings.enabled_platforms.contains(&platform) {
                return Err(UmbraError::ValidationFailed {
                    field: "platform".to_string(),
                    reason: format!("{platform} is disabled for this organization"),
                });
            }
        }
        let connector = self.connector(platform)?;
        let state = OAuthState::new(organization_id, platform);
        let token = sign_state(&self.state_secret, &state).map_err(UmbraError::from)?;
        let url = connector.build_authorization_url(&token);
        Ok((url, token))
    }

    /// OAuth step 2: verify state, exchange the code, persist connection and
    /// credentials together
    pub async fn complete_authorization(
        &self,
        state_token: &str,
        code: &str,
    ) -> Result<PlatformConnection> {
        let state = verify_state(&self.state_secret, state_token).map_err(|_| {
            UmbraError::ValidationFailed {
                field: "state".to_string(),
                reason: "oauth state failed verification".to_string(),
            }
        })?;
        let connector = self.connector(state.platform)?;
        let exchanged = connector.exchange_code(code).await.map_err(UmbraError::from)?;

        // Reconnects land on the existing row for the same platform identity
        let existing = self
            .store
            .connections
            .find_identity(
                state.organization_id,
                state.platform,
                &exchanged.platform_user_id,
            )
            .await?;

        let now = Utc::now();
        let connection = match existing {
            Some(mut conn) => {
                conn.status = ConnectionStatus::Connected;
                conn.scopes = exchanged.credentials.scopes.clone();
                conn.display_name = exchanged.display_name.clone();
                conn.workspace = exchanged.workspace.clone();
                conn.credentials_blocked = false;
                conn.updated_at = now;
                conn
            }
            None => PlatformConnection {
                id: Uuid::new_v4(),
                organization_id: state.organization_id,
                platform: state.platform,
                platform_user_id: exchanged.platform_user_id.clone(),
                display_name: exchanged.display_name.clone(),
                status: ConnectionStatus::Connected,
                scopes: exchanged.credentials.scopes.clone(),
                health: ConnectionHealth::default(),
                workspace: exchanged.workspace.clone(),
                credentials_blocked: false,
                created_at: now,
                updated_at: now,
            },
        };

        // Connection row and ciphertext commit together (I2)
        let record = self
            .vault
            .seal_record(connection.organization_id, connection.id, &exchanged.credentials)
            .map_err(map_vault_error)?;
        self.store
            .transitions
            .apply_transition(connection.clone(), CredentialChange::Put(record))
            .await?;

        self.audit(
            connection.organization_id,
            AuditEventType::ConnectionCreated,
            Severity::Low,
            &exchanged.platform_user_id,
            format!("connection:{}", connection.id),
            serde_json::json!({"platform": state.platform}),
        )
        .await;

        Ok(connection)
    }

    /// User-initiated disconnect: best-effort upstream revoke, credentials
    /// deleted, row soft-disconnected
    pub async fn disconnect(&self, organization_id: Uuid, connection_id: Uuid) -> Result<()> {
        let mut conn = self
            .store
            .connections
            .get(organization_id, connection_id)
            .await?
            .ok_or_else(|| UmbraError::not_found(format!("connection {connection_id}")))?;

        if let Ok(creds) = self.vault.get(connection_id).await {
            let connector = self.connector(conn.platform)?;
            if let Err(err) = connector.revoke(&creds).await {
                tracing::warn!(%connection_id, error = %err, "upstream revoke failed; continuing");
            }
        }

        // Soft-disconnect and credential removal land in one unit
        conn.status = ConnectionStatus::Disconnected;
        conn.updated_at = Utc::now();
        self.store
            .transitions
            .apply_transition(conn, CredentialChange::Delete)
            .await?;

        self.audit(
            organization_id,
            AuditEventType::ConnectionDisconnected,
            Severity::Low,
            "operator",
            format!("connection:{connection_id}"),
            serde_json::json!({}),
        )
        .await;
        Ok(())
    }

    /// Current credentials, refreshed first when they expire within the
    /// lead window. The discovery engine calls this at run start.
    pub async fn ensure_fresh_credentials(
        &self,
        conn: &PlatformConnection,
    ) -> Result<OAuthCredentials> {
        if conn.credentials_blocked {
            return Err(UmbraError::DecryptionFailure {
                connection_id: conn.id.to_string(),
            });
        }
        let creds = match self.vault.get(conn.id).await {
            Ok(creds) => creds,
            Err(VaultError::DecryptionFailure(_)) => {
                self.block_credentials(conn).await?;
                return Err(UmbraError::DecryptionFailure {
                    connection_id: conn.id.to_string(),
                });
            }
            Err(err) => return Err(map_vault_error(err)),
        };
        if creds.expires_within(Utc::now(), REFRESH_LEAD_SECS) {
            return self.refresh_credentials(conn).await;
        }
        Ok(creds)
    }

    /// Read current credentials without triggering a refresh; the
    /// scheduler uses this to decide whether a refresh is due
    pub async fn peek_credentials(&self, connection_id: Uuid) -> Result<OAuthCredentials> {
        self.vault.get(connection_id).await.map_err(map_vault_error)
    }

    /// Refresh with single-flight per connection: the second caller waits
    /// and reuses the first's result via the vault re-read.
    pub async fn refresh_credentials(&self, conn: &PlatformConnection) -> Result<OAuthCredentials> {
        let guard = self
            .refresh_guards
            .entry(conn.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = guard.lock().await;

        // Another caller may have finished while we waited
        let current = self.vault.get(conn.id).await.map_err(map_vault_error)?;
        if !current.expires_within(Utc::now(), REFRESH_LEAD_SECS) {
            return Ok(current);
        }

        let connector = self.connector(conn.platform)?;
        match connector.refresh(&current).await {
            Ok(fresh) => {
                // Rotated ciphertext and the status transition commit as
                // one unit; a crash cannot leave them disagreeing
                let record = self
                    .vault
                    .seal_record(conn.organization_id, conn.id, &fresh)
                    .map_err(map_vault_error)?;
                let mut updated = conn.clone();
                updated.scopes = fresh.scopes.clone();
                updated.status = ConnectionStatus::Connected;
                updated.updated_at = Utc::now();
                self.store
                    .transitions
                    .apply_transition(updated, CredentialChange::Put(record))
                    .await?;
                self.audit(
                    conn.organization_id,
                    AuditEventType::CredentialsRotated,
                    Severity::Low,
                    "system",
                    format!("connection:{}", conn.id),
                    serde_json::json!({}),
                )
                .await;
                Ok(fresh)
            }
            Err(ConnectorError::InvalidGrant(reason)) => {
                // Terminal refresh failure: connected -> expired, persisted
                // through the same transactional unit as other transitions
                let mut updated = conn.clone();
                updated.status = ConnectionStatus::Expired;
                updated.updated_at = Utc::now();
                self.store
                    .transitions
                    .apply_transition(updated, CredentialChange::Keep)
                    .await?;
                tracing::warn!(connection = %conn.id, %reason, "refresh failed with invalid grant; connection expired");
                Err(UmbraError::InvalidGrant { reason })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Token probe plus health snapshot update; a failing probe moves a
    /// connected connection to `error`, a passing one restores it
    pub async fn health_check(&self, conn: &PlatformConnection) -> Result<ConnectionHealth> {
        let connector = self.connector(conn.platform)?;
        let creds = match self.vault.get(conn.id).await {
            Ok(creds) => creds,
            Err(err) => {
                let health = ConnectionHealth {
                    healthy: false,
                    last_checked: Some(Utc::now()),
                    latency_ms: None,
                    consecutive_failures: conn.health.consecutive_failures + 1,
                    detail: Some("credentials unavailable".to_string()),
                };
                let mut updated = conn.clone();
                updated.health = health.clone();
                updated.updated_at = Utc::now();
                self.store.connections.update(updated).await?;
                return match err {
                    VaultError::NotFound(_) => Ok(health),
                    other => Err(map_vault_error(other)),
                };
            }
        };

        let probe = connector.validate_token(&creds).await;
        let mut updated = conn.clone();
        let health = match probe {
            Ok(probe) if probe.valid => {
                if updated.status == ConnectionStatus::Error {
                    updated.status = ConnectionStatus::Connected;
                }
                ConnectionHealth {
                    healthy: true,
                    last_checked: Some(Utc::now()),
                    latency_ms: Some(probe.latency_ms),
                    consecutive_failures: 0,
                    detail: None,
                }
            }
            Ok(probe) => {
                if updated.status == ConnectionStatus::Connected {
                    updated.status = ConnectionStatus::Error;
                }
                ConnectionHealth {
                    healthy: false,
                    last_checked: Some(Utc::now()),
                    latency_ms: Some(probe.latency_ms),
                    consecutive_failures: conn.health.consecutive_failures + 1,
                    detail: probe.detail,
                }
            }
            Err(err) => {
                if updated.status == ConnectionStatus::Connected {
                    updated.status = ConnectionStatus::Error;
                }
                ConnectionHealth {
                    healthy: false,
                    last_checked: Some(Utc::now()),
                    latency_ms: None,
                    consecutive_failures: conn.health.consecutive_failures + 1,
                    detail: Some(err.to_string()),
                }
            }
        };
        updated.health = health.clone();
        updated.updated_at = Utc::now();
        self.store.connections.update(updated).await?;
        Ok(health)
    }

    /// Mark a connection's credentials unusable until rotated; audit-logged
    /// as a security-relevant event
    async fn block_credentials(&self, conn: &PlatformConnection) -> Result<()> {
        let mut updated = conn.clone();
        updated.credentials_blocked = true;
        updated.updated_at = Utc::now();
        self.store.connections.update(updated).await?;
        self.audit(
            conn.organization_id,
            AuditEventType::DecryptionFailure,
            Severity::Critical,
            "system",
            format!("connection:{}", conn.id),
            serde_json::json!({"action": "connection blocked until rotation"}),
        )
        .await;
        Ok(())
    }
}

fn map_vault_error(err: VaultError) -> UmbraError {
    match err {
        VaultError::KeyUnavailable(reason) => UmbraError::KeyUnavailable { reason },
        VaultError::DecryptionFailure(id) => UmbraError::DecryptionFailure {
            connection_id: id.to_string(),
        },
        VaultError::NotFound(id) => UmbraError::not_found(format!("credentials for {id}")),
        VaultError::Storage(reason) => UmbraError::Internal { reason },
        VaultError::Serialization => UmbraError::Internal {
            reason: "credential serialization".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_connectors::mock::{MockConnector, RefreshBehavior};
    use umbra_vault::DerivedKeyProvider;

    fn manager_with(mock: MockConnector) -> (ConnectionManager, Store, Arc<CredentialVault>) {
        let store = Store::memory();
        let vault = Arc::new(CredentialVault::new(
            Arc::new(DerivedKeyProvider::random(1)),
            store.credentials.clone(),
        ));
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(mock));
        let manager = ConnectionManager::new(
            store.clone(),
            vault.clone(),
            Arc::new(registry),
            "state-secret",
        );
        (manager, store, vault)
    }

    async fn connected(manager: &ConnectionManager) -> PlatformConnection {
        let org = Uuid::new_v4();
        let (_, state) = manager.begin_authorization(org, Platform::Slack).await.unwrap();
        manager.complete_authorization(&state, "code-1").await.unwrap()
    }

    #[tokio::test]
    async fn oauth_round_trip_creates_connected_connection_with_credentials() {
        let (manager, store, vault) = manager_with(MockConnector::new(Platform::Slack));
        let conn = connected(&manager).await;

        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert_eq!(conn.platform_user_id, "mock-user");
        let creds = vault.get(conn.id).await.unwrap();
        assert_eq!(creds.access_token, "mock-access-code-1");

        // Invariant: a connected connection always decrypts (I2)
        let listed = store.connections.list_for_org(conn.organization_id).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn reauthorizing_the_same_identity_reuses_the_row() {
        let (manager, store, _) = manager_with(MockConnector::new(Platform::Slack));
        let first = connected(&manager).await;

        let (_, state) = manager
            .begin_authorization(first.organization_id, Platform::Slack)
            .await
            .unwrap();
        let second = manager.complete_authorization(&state, "code-2").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.connections.list_for_org(first.organization_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tampered_state_is_rejected() {
        let (manager, _, _) = manager_with(MockConnector::new(Platform::Slack));
        let err = manager
            .complete_authorization("bogus-state", "code")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationFailed");
    }

    #[tokio::test]
    async fn expiring_credentials_are_refreshed_before_use() {
        let (manager, _, vault) = manager_with(MockConnector::new(Platform::Slack));
        let conn = connected(&manager).await;

        // Force imminent expiry
        let mut creds = vault.get(conn.id).await.unwrap();
        creds.expires_at = Some(Utc::now() + chrono::Duration::seconds(1));
        vault
            .rotate(conn.organization_id, conn.id, &creds)
            .await
            .unwrap();

        let fresh = manager.ensure_fresh_credentials(&conn).await.unwrap();
        assert!(fresh.access_token.ends_with("-refreshed"));
        // The rotated ciphertext is what the vault now serves
        assert_eq!(vault.get(conn.id).await.unwrap(), fresh);
    }

    #[tokio::test]
    async fn invalid_grant_on_refresh_expires_the_connection() {
        let (manager, store, vault) = manager_with(
            MockConnector::new(Platform::Slack).with_refresh_behavior(RefreshBehavior::InvalidGrant),
        );
        let conn = connected(&manager).await;
        let mut creds = vault.get(conn.id).await.unwrap();
        creds.expires_at = Some(Utc::now());
        vault.rotate(conn.organization_id, conn.id, &creds).await.unwrap();

        let err = manager.ensure_fresh_credentials(&conn).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidGrant");

        let reloaded = store
            .connections
            .get(conn.organization_id, conn.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, ConnectionStatus::Expired);
    }

    #[tokio::test]
    async fn concurrent_refreshes_single_flight() {
        let (manager, _, vault) = manager_with(MockConnector::new(Platform::Slack));
        let manager = Arc::new(manager);
        let conn = connected(&manager).await;
        let mut creds = vault.get(conn.id).await.unwrap();
        creds.expires_at = Some(Utc::now());
        vault.rotate(conn.organization_id, conn.id, &creds).await.unwrap();

        let a = {
            let manager = manager.clone();
            let conn = conn.clone();
            tokio::spawn(async move { manager.refresh_credentials(&conn).await })
        };
        let b = {
            let manager = manager.clone();
            let conn = conn.clone();
            tokio::spawn(async move { manager.refresh_credentials(&conn).await })
        };
        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(ra, rb);
    }

    #[tokio::test]
    async fn failed_health_check_marks_error_and_recovery_restores() {
        let (manager, store, _) = manager_with(
            MockConnector::new(Platform::Slack).with_token_valid(false),
        );
        let conn = connected(&manager).await;

        let health = manager.health_check(&conn).await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.consecutive_failures, 1);
        let reloaded = store
            .connections
            .get(conn.organization_id, conn.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn disconnect_removes_credentials_and_soft_disconnects() {
        let (manager, store, vault) = manager_with(MockConnector::new(Platform::Slack));
        let conn = connected(&manager).await;

        manager.disconnect(conn.organization_id, conn.id).await.unwrap();

        assert!(matches!(
            vault.get(conn.id).await.unwrap_err(),
            VaultError::NotFound(_)
        ));
        let reloaded = store
            .connections
            .get(conn.organization_id, conn.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, ConnectionStatus::Disconnected);

        let audit = store.audit.list_recent(conn.organization_id, 10).await.unwrap();
        assert!(audit
            .iter()
            .any(|e| e.event_type == AuditEventType::ConnectionDisconnected));
    }
}
