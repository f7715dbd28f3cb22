//! Postgres backend
//!
//! Runtime-bound sqlx queries over the schema in [`crate::schema`]. Enum
//! columns store the serde wire form; nested structures are JSONB so later
//! fields stay additive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use umbra_core::types::*;
use umbra_core::vendor;
use umbra_core::{Result, UmbraError};
use umbra_vault::{CredentialRecordRepo, VaultError};
use uuid::Uuid;

use crate::repos::*;

/// Postgres-backed store; cheap to clone, shares the pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> UmbraError {
    UmbraError::internal(format!("database: {e}"))
}

/// Serde wire form of a unit enum variant, for TEXT columns
fn to_tag<T: serde::Serialize>(v: &T) -> String {
    match serde_json::to_value(v) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

/// Parse a TEXT column back into its enum
fn from_tag<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| UmbraError::internal(format!("bad enum tag {s:?}: {e}")))
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<serde_json::Value> {
    serde_json::to_value(v).map_err(UmbraError::from)
}

fn from_json<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> Result<T> {
    serde_json::from_value(v).map_err(UmbraError::from)
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn map_organization(row: &PgRow) -> Result<Organization> {
    Ok(Organization {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        tier: from_tag(row.try_get::<String, _>("tier").map_err(db_err)?.as_str())?,
        settings: from_json(row.try_get("settings").map_err(db_err)?)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_connection(row: &PgRow) -> Result<PlatformConnection> {
    Ok(PlatformConnection {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        platform: from_tag(row.try_get::<String, _>("platform").map_err(db_err)?.as_str())?,
        platform_user_id: row.try_get("platform_user_id").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        status: from_tag(row.try_get::<String, _>("status").map_err(db_err)?.as_str())?,
        scopes: from_json(row.try_get("scopes").map_err(db_err)?)?,
        health: from_json(row.try_get("health").map_err(db_err)?)?,
        workspace: row.try_get("workspace").map_err(db_err)?,
        credentials_blocked: row.try_get("credentials_blocked").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn map_run(row: &PgRow) -> Result<DiscoveryRun> {
    Ok(DiscoveryRun {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        connection_id: row.try_get("connection_id").map_err(db_err)?,
        status: from_tag(row.try_get::<String, _>("status").map_err(db_err)?.as_str())?,
        trigger: from_tag(row.try_get::<String, _>("trigger_kind").map_err(db_err)?.as_str())?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        progress: from_json(row.try_get("progress").map_err(db_err)?)?,
        warnings: from_json(row.try_get("warnings").map_err(db_err)?)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_automation(row: &PgRow) -> Result<DiscoveredAutomation> {
    Ok(DiscoveredAutomation {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        connection_id: row.try_get("connection_id").map_err(db_err)?,
        discovery_run_id: row.try_get("discovery_run_id").map_err(db_err)?,
        external_id: row.try_get("external_id").map_err(db_err)?,
        automation_type: from_tag(
            row.try_get::<String, _>("automation_type").map_err(db_err)?.as_str(),
        )?,
        name: row.try_get("name").map_err(db_err)?,
        platform: from_tag(row.try_get::<String, _>("platform").map_err(db_err)?.as_str())?,
        platform_metadata: row.try_get("platform_metadata").map_err(db_err)?,
        permissions: from_json(row.try_get("permissions").map_err(db_err)?)?,
        owner: row.try_get("owner").map_err(db_err)?,
        vendor_name: row.try_get("vendor_name").map_err(db_err)?,
        vendor_group: row.try_get("vendor_group").map_err(db_err)?,
        vendor_override: row.try_get("vendor_override").map_err(db_err)?,
        is_active: row.try_get("is_active").map_err(db_err)?,
        first_discovered_at: row.try_get("first_discovered_at").map_err(db_err)?,
        last_seen_at: row.try_get("last_seen_at").map_err(db_err)?,
    })
}

fn map_detection(row: &PgRow) -> Result<DetectionPattern> {
    Ok(DetectionPattern {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        automation_id: row.try_get("automation_id").map_err(db_err)?,
        pattern_type: from_tag(row.try_get::<String, _>("pattern_type").map_err(db_err)?.as_str())?,
        confidence: row.try_get("confidence").map_err(db_err)?,
        severity: from_tag(row.try_get::<String, _>("severity").map_err(db_err)?.as_str())?,
        evidence: row.try_get("evidence").map_err(db_err)?,
        evidence_hash: row.try_get("evidence_hash").map_err(db_err)?,
        detected_at: row.try_get("detected_at").map_err(db_err)?,
    })
}

fn map_risk(row: &PgRow) -> Result<RiskAssessment> {
    Ok(RiskAssessment {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        automation_id: row.try_get("automation_id").map_err(db_err)?,
        risk_level: from_tag(row.try_get::<String, _>("risk_level").map_err(db_err)?.as_str())?,
        risk_score: row.try_get("risk_score").map_err(db_err)?,
        sub_scores: from_json(row.try_get("sub_scores").map_err(db_err)?)?,
        assessed_at: row.try_get("assessed_at").map_err(db_err)?,
    })
}

fn map_feedback(row: &PgRow) -> Result<AutomationFeedback> {
    Ok(AutomationFeedback {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        automation_id: row.try_get("automation_id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        feedback_type: from_tag(
            row.try_get::<String, _>("feedback_type").map_err(db_err)?.as_str(),
        )?,
        detection_snapshot: row.try_get("detection_snapshot").map_err(db_err)?,
        correction: row.try_get("correction").map_err(db_err)?,
        features: from_json(row.try_get("features").map_err(db_err)?)?,
        status: from_tag(row.try_get::<String, _>("status").map_err(db_err)?.as_str())?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_chain(row: &PgRow) -> Result<CorrelationChain> {
    Ok(CorrelationChain {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        automation_ids: from_json(row.try_get("automation_ids").map_err(db_err)?)?,
        correlation_type: from_tag(
            row.try_get::<String, _>("correlation_type").map_err(db_err)?.as_str(),
        )?,
        supporting: from_json(row.try_get("supporting").map_err(db_err)?)?,
        confidence: row.try_get("confidence").map_err(db_err)?,
        cross_platform_chain: row.try_get("cross_platform_chain").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_audit(row: &PgRow) -> Result<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        event_type: from_tag(row.try_get::<String, _>("event_type").map_err(db_err)?.as_str())?,
        severity: from_tag(row.try_get::<String, _>("severity").map_err(db_err)?.as_str())?,
        actor: row.try_get("actor").map_err(db_err)?,
        resource: row.try_get("resource").map_err(db_err)?,
        details: row.try_get("details").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_activity(row: &PgRow) -> Result<ActivityEvent> {
    Ok(ActivityEvent {
        id: row.try_get("id").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
        connection_id: row.try_get("connection_id").map_err(db_err)?,
        automation_external_id: row.try_get("automation_external_id").map_err(db_err)?,
        actor_id: row.try_get("actor_id").map_err(db_err)?,
        event_type: row.try_get("event_type").map_err(db_err)?,
        target: row.try_get::<Option<String>, _>("target").map_err(db_err)?,
        bytes: row
            .try_get::<Option<i64>, _>("bytes")
            .map_err(db_err)?
            .map(|v| v as u64),
        records: row
            .try_get::<Option<i64>, _>("records")
            .map_err(db_err)?
            .map(|v| v as u64),
        occurred_at: row.try_get("occurred_at").map_err(db_err)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection-scoped writers
//
// These run against a borrowed `PgConnection` so single-statement callers
// and multi-statement transactions share one implementation.
// ═══════════════════════════════════════════════════════════════════════════

async fn upsert_connection_on(
    executor: &mut sqlx::PgConnection,
    conn: &PlatformConnection,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO platform_connections
         (id, organization_id, platform, platform_user_id, display_name, status,
          scopes, health, workspace, credentials_blocked, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         ON CONFLICT (id) DO UPDATE SET
            display_name = EXCLUDED.display_name, status = EXCLUDED.status,
            scopes = EXCLUDED.scopes, health = EXCLUDED.health,
            workspace = EXCLUDED.workspace,
            credentials_blocked = EXCLUDED.credentials_blocked,
            updated_at = EXCLUDED.updated_at",
    )
    .bind(conn.id)
    .bind(conn.organization_id)
    .bind(to_tag(&conn.platform))
    .bind(&conn.platform_user_id)
    .bind(&conn.display_name)
    .bind(to_tag(&conn.status))
    .bind(to_json(&conn.scopes)?)
    .bind(to_json(&conn.health)?)
    .bind(&conn.workspace)
    .bind(conn.credentials_blocked)
    .bind(conn.created_at)
    .bind(conn.updated_at)
    .execute(executor)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn put_credentials_on(
    executor: &mut sqlx::PgConnection,
    record: &EncryptedCredentialRecord,
) -> std::result::Result<(), VaultError> {
    sqlx::query(
        "INSERT INTO encrypted_credentials
         (connection_id, organization_id, ciphertext, nonce, wrapped_data_key,
          wrap_nonce, key_version, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (connection_id) DO UPDATE SET
            ciphertext = EXCLUDED.ciphertext, nonce = EXCLUDED.nonce,
            wrapped_data_key = EXCLUDED.wrapped_data_key,
            wrap_nonce = EXCLUDED.wrap_nonce,
            key_version = EXCLUDED.key_version, updated_at = EXCLUDED.updated_at",
    )
    .bind(record.connection_id)
    .bind(record.organization_id)
    .bind(&record.ciphertext)
    .bind(&record.nonce)
    .bind(&record.wrapped_data_key)
    .bind(&record.wrap_nonce)
    .bind(i64::from(record.key_version))
    .bind(record.updated_at)
    .execute(executor)
    .await
    .map_err(|e| VaultError::Storage(e.to_string()))?;
    Ok(())
}

async fn upsert_automation_on(
    executor: &mut sqlx::PgConnection,
    organization_id: Uuid,
    connection_id: Uuid,
    run_id: Uuid,
    platform: Platform,
    normalized: &NormalizedAutomation,
    now: DateTime<Utc>,
) -> Result<(DiscoveredAutomation, UpsertOutcome)> {
    let existing = sqlx::query(
        "SELECT * FROM discovered_automations
         WHERE connection_id = $1 AND external_id = $2",
    )
    .bind(connection_id)
    .bind(&normalized.external_id)
    .fetch_optional(&mut *executor)
    .await
    .map_err(db_err)?;

    if let Some(row) = existing {
        let current = map_automation(&row)?;
        let (vendor_name, vendor_group) = if current.vendor_override {
            (current.vendor_name.clone(), current.vendor_group.clone())
        } else {
            (
                normalized.vendor_name.clone(),
                vendor::vendor_group(normalized.vendor_name.as_deref(), platform),
            )
        };
        let row = sqlx::query(
            "UPDATE discovered_automations SET
                discovery_run_id = $2, automation_type = $3, name = $4,
                platform_metadata = $5, permissions = $6, owner = $7,
                vendor_name = $8, vendor_group = $9, is_active = TRUE,
                last_seen_at = $10
             WHERE id = $1
             RETURNING *",
        )
        .bind(current.id)
        .bind(run_id)
        .bind(to_tag(&normalized.automation_type))
        .bind(&normalized.name)
        .bind(&normalized.platform_metadata)
        .bind(to_json(&normalized.permissions)?)
        .bind(&normalized.owner)
        .bind(&vendor_name)
        .bind(&vendor_group)
        .bind(now)
        .fetch_one(&mut *executor)
        .await
        .map_err(db_err)?;
        return Ok((map_automation(&row)?, UpsertOutcome::Updated));
    }

    let vendor_group = vendor::vendor_group(normalized.vendor_name.as_deref(), platform);
    let row = sqlx::query(
        "INSERT INTO discovered_automations
         (id, organization_id, connection_id, discovery_run_id, external_id,
          automation_type, name, platform, platform_metadata, permissions, owner,
          vendor_name, vendor_group, vendor_override, is_active,
          first_discovered_at, last_seen_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                 FALSE, TRUE, $14, $14)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(connection_id)
    .bind(run_id)
    .bind(&normalized.external_id)
    .bind(to_tag(&normalized.automation_type))
    .bind(&normalized.name)
    .bind(to_tag(&platform))
    .bind(&normalized.platform_metadata)
    .bind(to_json(&normalized.permissions)?)
    .bind(&normalized.owner)
    .bind(&normalized.vendor_name)
    .bind(&vendor_group)
    .bind(now)
    .fetch_one(&mut *executor)
    .await
    .map_err(db_err)?;
    Ok((map_automation(&row)?, UpsertOutcome::Inserted))
}

async fn insert_risk_on(
    executor: &mut sqlx::PgConnection,
    assessment: &RiskAssessment,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO risk_assessments
         (id, organization_id, automation_id, risk_level, risk_score,
          sub_scores, assessed_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(assessment.id)
    .bind(assessment.organization_id)
    .bind(assessment.automation_id)
    .bind(to_tag(&assessment.risk_level))
    .bind(assessment.risk_score)
    .bind(to_json(&assessment.sub_scores)?)
    .bind(assessment.assessed_at)
    .execute(executor)
    .await
    .map_err(db_err)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Repositories
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl TransitionRepo for PgStore {
    async fn apply_transition(
        &self,
        conn: PlatformConnection,
        change: CredentialChange,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        upsert_connection_on(&mut *tx, &conn).await?;
        match change {
            CredentialChange::Put(record) => {
                put_credentials_on(&mut *tx, &record)
                    .await
                    .map_err(|e| UmbraError::internal(format!("credential write: {e}")))?;
            }
            CredentialChange::Delete => {
                sqlx::query("DELETE FROM encrypted_credentials WHERE connection_id = $1")
                    .bind(conn.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
            CredentialChange::Keep => {}
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl OrganizationRepo for PgStore {
    async fn create(&self, org: Organization) -> Result<()> {
        sqlx::query(
            "INSERT INTO organizations (id, name, tier, settings, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(to_tag(&org.tier))
        .bind(to_json(&org.settings)?)
        .bind(org.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_organization).transpose()
    }

    async fn update_settings(&self, id: Uuid, settings: OrgSettings) -> Result<()> {
        let updated = sqlx::query("UPDATE organizations SET settings = $2 WHERE id = $1")
            .bind(id)
            .bind(to_json(&settings)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(UmbraError::not_found(format!("organization {id}")));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Organization>> {
        let rows = sqlx::query("SELECT * FROM organizations ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(map_organization).collect()
    }
}

#[async_trait]
impl ConnectionRepo for PgStore {
    async fn insert(&self, conn: PlatformConnection) -> Result<()> {
        sqlx::query(
            "INSERT INTO platform_connections
             (id, organization_id, platform, platform_user_id, display_name, status,
              scopes, health, workspace, credentials_blocked, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(conn.id)
        .bind(conn.organization_id)
        .bind(to_tag(&conn.platform))
        .bind(&conn.platform_user_id)
        .bind(&conn.display_name)
        .bind(to_tag(&conn.status))
        .bind(to_json(&conn.scopes)?)
        .bind(to_json(&conn.health)?)
        .bind(&conn.workspace)
        .bind(conn.credentials_blocked)
        .bind(conn.created_at)
        .bind(conn.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<PlatformConnection>> {
        let row = sqlx::query(
            "SELECT * FROM platform_connections WHERE id = $1 AND organization_id = $2",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_connection).transpose()
    }

    async fn get_any(&self, id: Uuid) -> Result<Option<PlatformConnection>> {
        let row = sqlx::query("SELECT * FROM platform_connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_connection).transpose()
    }

    async fn find_identity(
        &self,
        organization_id: Uuid,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Option<PlatformConnection>> {
        let row = sqlx::query(
            "SELECT * FROM platform_connections
             WHERE organization_id = $1 AND platform = $2 AND platform_user_id = $3",
        )
        .bind(organization_id)
        .bind(to_tag(&platform))
        .bind(platform_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_connection).transpose()
    }

    async fn list_for_org(&self, organization_id: Uuid) -> Result<Vec<PlatformConnection>> {
        let rows = sqlx::query(
            "SELECT * FROM platform_connections WHERE organization_id = $1 ORDER BY created_at",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_connection).collect()
    }

    async fn list_all(&self) -> Result<Vec<PlatformConnection>> {
        let rows = sqlx::query("SELECT * FROM platform_connections")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(map_connection).collect()
    }

    async fn update(&self, conn: PlatformConnection) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE platform_connections SET
                display_name = $2, status = $3, scopes = $4, health = $5,
                workspace = $6, credentials_blocked = $7, updated_at = $8
             WHERE id = $1",
        )
        .bind(conn.id)
        .bind(&conn.display_name)
        .bind(to_tag(&conn.status))
        .bind(to_json(&conn.scopes)?)
        .bind(to_json(&conn.health)?)
        .bind(&conn.workspace)
        .bind(conn.credentials_blocked)
        .bind(conn.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(UmbraError::not_found(format!("connection {}", conn.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl RunRepo for PgStore {
    async fn insert(&self, run: DiscoveryRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO discovery_runs
             (id, organization_id, connection_id, status, trigger_kind,
              started_at, completed_at, progress, warnings, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(run.id)
        .bind(run.organization_id)
        .bind(run.connection_id)
        .bind(to_tag(&run.status))
        .bind(to_tag(&run.trigger))
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(to_json(&run.progress)?)
        .bind(to_json(&run.warnings)?)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<DiscoveryRun>> {
        let row = sqlx::query(
            "SELECT * FROM discovery_runs WHERE id = $1 AND organization_id = $2",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_run).transpose()
    }

    async fn update(&self, run: DiscoveryRun) -> Result<()> {
        // Terminal runs are immutable; the WHERE clause enforces it
        let updated = sqlx::query(
            "UPDATE discovery_runs SET
                status = $2, started_at = $3, completed_at = $4,
                progress = $5, warnings = $6
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(run.id)
        .bind(to_tag(&run.status))
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(to_json(&run.progress)?)
        .bind(to_json(&run.warnings)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM discovery_runs WHERE id = $1")
                .bind(run.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            return Err(match exists {
                Some(_) => UmbraError::Conflict {
                    reason: format!("run {} is terminal and immutable", run.id),
                },
                None => UmbraError::not_found(format!("run {}", run.id)),
            });
        }
        Ok(())
    }

    async fn active_for_connection(&self, connection_id: Uuid) -> Result<Option<DiscoveryRun>> {
        let row = sqlx::query(
            "SELECT * FROM discovery_runs
             WHERE connection_id = $1 AND status IN ('queued', 'running')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_run).transpose()
    }

    async fn list_for_connection(&self, connection_id: Uuid, limit: u32) -> Result<Vec<DiscoveryRun>> {
        let limit = if limit == 0 { i64::MAX } else { i64::from(limit) };
        let rows = sqlx::query(
            "SELECT * FROM discovery_runs WHERE connection_id = $1
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(connection_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_run).collect()
    }
}

#[async_trait]
impl AutomationRepo for PgStore {
    async fn upsert(
        &self,
        organization_id: Uuid,
        connection_id: Uuid,
        run_id: Uuid,
        platform: Platform,
        normalized: &NormalizedAutomation,
        now: DateTime<Utc>,
    ) -> Result<(DiscoveredAutomation, UpsertOutcome)> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        upsert_automation_on(
            &mut *conn,
            organization_id,
            connection_id,
            run_id,
            platform,
            normalized,
            now,
        )
        .await
    }

    async fn upsert_with_assessment(
        &self,
        organization_id: Uuid,
        connection_id: Uuid,
        run_id: Uuid,
        platform: Platform,
        normalized: &NormalizedAutomation,
        mut assessment: RiskAssessment,
        now: DateTime<Utc>,
    ) -> Result<(DiscoveredAutomation, UpsertOutcome)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (automation, outcome) = upsert_automation_on(
            &mut *tx,
            organization_id,
            connection_id,
            run_id,
            platform,
            normalized,
            now,
        )
        .await?;
        assessment.organization_id = automation.organization_id;
        assessment.automation_id = automation.id;
        insert_risk_on(&mut *tx, &assessment).await?;
        tx.commit().await.map_err(db_err)?;
        Ok((automation, outcome))
    }

    async fn find_by_external(
        &self,
        connection_id: Uuid,
        external_id: &str,
    ) -> Result<Option<DiscoveredAutomation>> {
        let row = sqlx::query(
            "SELECT * FROM discovered_automations
             WHERE connection_id = $1 AND external_id = $2",
        )
        .bind(connection_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_automation).transpose()
    }

    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<DiscoveredAutomation>> {
        let row = sqlx::query(
            "SELECT * FROM discovered_automations WHERE id = $1 AND organization_id = $2",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_automation).transpose()
    }

    async fn list(&self, organization_id: Uuid, filter: &AutomationFilter) -> Result<Vec<DiscoveredAutomation>> {
        let limit = if filter.limit == 0 { i64::MAX } else { i64::from(filter.limit) };
        let offset = if filter.limit == 0 {
            0
        } else {
            i64::from(filter.page) * i64::from(filter.limit)
        };
        let rows = sqlx::query(
            "SELECT * FROM discovered_automations
             WHERE organization_id = $1
               AND (is_active = TRUE OR $2)
               AND ($3::text IS NULL OR platform = $3)
               AND ($4::timestamptz IS NULL OR first_discovered_at >= $4)
             ORDER BY first_discovered_at DESC, id
             LIMIT $5 OFFSET $6",
        )
        .bind(organization_id)
        .bind(filter.include_inactive)
        .bind(filter.platform.map(|p| to_tag(&p)))
        .bind(filter.discovered_after)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_automation).collect()
    }

    async fn deactivate_unseen(
        &self,
        connection_id: Uuid,
        run_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE discovered_automations SET is_active = FALSE
             WHERE connection_id = $1 AND discovery_run_id <> $2
               AND is_active = TRUE AND last_seen_at < $3",
        )
        .bind(connection_id)
        .bind(run_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(updated.rows_affected())
    }

    async fn override_vendor(
        &self,
        organization_id: Uuid,
        id: Uuid,
        vendor_name: Option<String>,
    ) -> Result<DiscoveredAutomation> {
        let row = sqlx::query(
            "UPDATE discovered_automations SET
                vendor_name = $3,
                vendor_group = CASE WHEN $3 IS NULL THEN NULL
                               ELSE lower($3::text) || '-' || platform END,
                vendor_override = $4
             WHERE id = $1 AND organization_id = $2
             RETURNING *",
        )
        .bind(id)
        .bind(organization_id)
        .bind(&vendor_name)
        .bind(vendor_name.is_some())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| UmbraError::not_found(format!("automation {id}")))?;
        map_automation(&row)
    }
}

#[async_trait]
impl DetectionRepo for PgStore {
    async fn insert_if_new(&self, pattern: DetectionPattern) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO detection_patterns
             (id, organization_id, automation_id, pattern_type, confidence,
              severity, evidence, evidence_hash, detected_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (evidence_hash) DO NOTHING",
        )
        .bind(pattern.id)
        .bind(pattern.organization_id)
        .bind(pattern.automation_id)
        .bind(to_tag(&pattern.pattern_type))
        .bind(pattern.confidence)
        .bind(to_tag(&pattern.severity))
        .bind(&pattern.evidence)
        .bind(&pattern.evidence_hash)
        .bind(pattern.detected_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(inserted.rows_affected() > 0)
    }

    async fn list_for_automation(
        &self,
        organization_id: Uuid,
        automation_id: Uuid,
        limit: u32,
    ) -> Result<Vec<DetectionPattern>> {
        let limit = if limit == 0 { i64::MAX } else { i64::from(limit) };
        let rows = sqlx::query(
            "SELECT * FROM detection_patterns
             WHERE organization_id = $1 AND automation_id = $2
             ORDER BY detected_at DESC LIMIT $3",
        )
        .bind(organization_id)
        .bind(automation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_detection).collect()
    }

    async fn list_since(&self, organization_id: Uuid, since: DateTime<Utc>) -> Result<Vec<DetectionPattern>> {
        let rows = sqlx::query(
            "SELECT * FROM detection_patterns
             WHERE organization_id = $1 AND detected_at >= $2
             ORDER BY detected_at",
        )
        .bind(organization_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_detection).collect()
    }
}

#[async_trait]
impl RiskRepo for PgStore {
    async fn insert(&self, assessment: RiskAssessment) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        insert_risk_on(&mut *conn, &assessment).await
    }

    async fn current_for_automation(
        &self,
        organization_id: Uuid,
        automation_id: Uuid,
    ) -> Result<Option<RiskAssessment>> {
        let row = sqlx::query(
            "SELECT * FROM risk_assessments
             WHERE organization_id = $1 AND automation_id = $2
             ORDER BY assessed_at DESC LIMIT 1",
        )
        .bind(organization_id)
        .bind(automation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_risk).transpose()
    }

    async fn current_for_org(&self, organization_id: Uuid) -> Result<HashMap<Uuid, RiskAssessment>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (automation_id) * FROM risk_assessments
             WHERE organization_id = $1
             ORDER BY automation_id, assessed_at DESC",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let risk = map_risk(row)?;
            out.insert(risk.automation_id, risk);
        }
        Ok(out)
    }
}

#[async_trait]
impl FeedbackRepo for PgStore {
    async fn insert(&self, feedback: AutomationFeedback) -> Result<()> {
        sqlx::query(
            "INSERT INTO automation_feedback
             (id, organization_id, automation_id, user_id, feedback_type,
              detection_snapshot, correction, features, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(feedback.id)
        .bind(feedback.organization_id)
        .bind(feedback.automation_id)
        .bind(&feedback.user_id)
        .bind(to_tag(&feedback.feedback_type))
        .bind(&feedback.detection_snapshot)
        .bind(&feedback.correction)
        .bind(to_json(&feedback.features)?)
        .bind(to_tag(&feedback.status))
        .bind(feedback.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_pending(&self, organization_id: Uuid) -> Result<Vec<AutomationFeedback>> {
        let rows = sqlx::query(
            "SELECT * FROM automation_feedback
             WHERE organization_id = $1 AND status = 'pending'
             ORDER BY created_at",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_feedback).collect()
    }

    async fn mark_applied(&self, organization_id: Uuid, ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            "UPDATE automation_feedback SET status = 'applied'
             WHERE organization_id = $1 AND id = ANY($2)",
        )
        .bind(organization_id)
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl BaselineRepo for PgStore {
    async fn get(&self, organization_id: Uuid) -> Result<Option<BehavioralBaseline>> {
        let row = sqlx::query("SELECT baseline FROM behavioral_baselines WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_json(r.try_get("baseline").map_err(db_err)?))
            .transpose()
    }

    async fn upsert(&self, baseline: BehavioralBaseline) -> Result<()> {
        sqlx::query(
            "INSERT INTO behavioral_baselines (organization_id, baseline, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (organization_id) DO UPDATE
             SET baseline = EXCLUDED.baseline, updated_at = EXCLUDED.updated_at",
        )
        .bind(baseline.organization_id)
        .bind(to_json(&baseline)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn thresholds(&self, organization_id: Uuid) -> Result<DetectorThresholds> {
        let row = sqlx::query("SELECT thresholds FROM detector_thresholds WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(r) => from_json(r.try_get("thresholds").map_err(db_err)?),
            None => Ok(DetectorThresholds::default()),
        }
    }

    async fn put_thresholds(&self, organization_id: Uuid, thresholds: DetectorThresholds) -> Result<()> {
        sqlx::query(
            "INSERT INTO detector_thresholds (organization_id, thresholds, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (organization_id) DO UPDATE
             SET thresholds = EXCLUDED.thresholds, updated_at = EXCLUDED.updated_at",
        )
        .bind(organization_id)
        .bind(to_json(&thresholds)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl ChainRepo for PgStore {
    async fn replace_touching(
        &self,
        organization_id: Uuid,
        touched: &[Uuid],
        chains: Vec<CorrelationChain>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if !touched.is_empty() {
            sqlx::query(
                "DELETE FROM correlation_chains
                 WHERE organization_id = $1 AND id IN (
                     SELECT chain_id FROM chain_members WHERE automation_id = ANY($2)
                 )",
            )
            .bind(organization_id)
            .bind(touched)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            sqlx::query(
                "DELETE FROM chain_members WHERE automation_id = ANY($1)
                 OR chain_id NOT IN (SELECT id FROM correlation_chains)",
            )
            .bind(touched)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for chain in &chains {
            sqlx::query(
                "INSERT INTO correlation_chains
                 (id, organization_id, automation_ids, correlation_type, supporting,
                  confidence, cross_platform_chain, description, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(chain.id)
            .bind(chain.organization_id)
            .bind(to_json(&chain.automation_ids)?)
            .bind(to_tag(&chain.correlation_type))
            .bind(to_json(&chain.supporting)?)
            .bind(chain.confidence)
            .bind(chain.cross_platform_chain)
            .bind(&chain.description)
            .bind(chain.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            for automation_id in &chain.automation_ids {
                sqlx::query(
                    "INSERT INTO chain_members (chain_id, automation_id) VALUES ($1, $2)
                     ON CONFLICT DO NOTHING",
                )
                .bind(chain.id)
                .bind(automation_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_for_org(&self, organization_id: Uuid) -> Result<Vec<CorrelationChain>> {
        let rows = sqlx::query(
            "SELECT * FROM correlation_chains WHERE organization_id = $1
             ORDER BY confidence DESC",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_chain).collect()
    }
}

#[async_trait]
impl AuditRepo for PgStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log
             (id, organization_id, event_type, severity, actor, resource, details, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(entry.organization_id)
        .bind(to_tag(&entry.event_type))
        .bind(to_tag(&entry.severity))
        .bind(&entry.actor)
        .bind(&entry.resource)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_recent(&self, organization_id: Uuid, limit: u32) -> Result<Vec<AuditLogEntry>> {
        let limit = if limit == 0 { i64::MAX } else { i64::from(limit) };
        let rows = sqlx::query(
            "SELECT * FROM audit_log WHERE organization_id = $1
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(organization_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_audit).collect()
    }
}

#[async_trait]
impl ActivityRepo for PgStore {
    async fn insert_batch(&self, events: Vec<ActivityEvent>) -> Result<()> {
        for event in &events {
            sqlx::query(
                "INSERT INTO activity_events
                 (id, organization_id, connection_id, automation_external_id, actor_id,
                  event_type, target, bytes, records, occurred_at, dedupe_key)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (dedupe_key) DO NOTHING",
            )
            .bind(event.id)
            .bind(event.organization_id)
            .bind(event.connection_id)
            .bind(&event.automation_external_id)
            .bind(&event.actor_id)
            .bind(&event.event_type)
            .bind(&event.target)
            .bind(event.bytes.map(|v| v as i64))
            .bind(event.records.map(|v| v as i64))
            .bind(event.occurred_at)
            .bind(activity_dedupe_key(event))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn window(
        &self,
        organization_id: Uuid,
        connection_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM activity_events
             WHERE organization_id = $1 AND occurred_at >= $2
               AND ($3::uuid IS NULL OR connection_id = $3)
             ORDER BY occurred_at",
        )
        .bind(organization_id)
        .bind(since)
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_activity).collect()
    }
}

#[async_trait]
impl CredentialRecordRepo for PgStore {
    async fn upsert(&self, record: EncryptedCredentialRecord) -> std::result::Result<(), VaultError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        put_credentials_on(&mut *conn, &record).await
    }

    async fn get(
        &self,
        connection_id: Uuid,
    ) -> std::result::Result<Option<EncryptedCredentialRecord>, VaultError> {
        let row = sqlx::query("SELECT * FROM encrypted_credentials WHERE connection_id = $1")
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        row.map(|r| {
            Ok(EncryptedCredentialRecord {
                connection_id: r.try_get("connection_id").map_err(|e| VaultError::Storage(e.to_string()))?,
                organization_id: r.try_get("organization_id").map_err(|e| VaultError::Storage(e.to_string()))?,
                ciphertext: r.try_get("ciphertext").map_err(|e| VaultError::Storage(e.to_string()))?,
                nonce: r.try_get("nonce").map_err(|e| VaultError::Storage(e.to_string()))?,
                wrapped_data_key: r.try_get("wrapped_data_key").map_err(|e| VaultError::Storage(e.to_string()))?,
                wrap_nonce: r.try_get("wrap_nonce").map_err(|e| VaultError::Storage(e.to_string()))?,
                key_version: r
                    .try_get::<i64, _>("key_version")
                    .map_err(|e| VaultError::Storage(e.to_string()))? as u32,
                updated_at: r.try_get("updated_at").map_err(|e| VaultError::Storage(e.to_string()))?,
            })
        })
        .transpose()
    }

    async fn delete(&self, connection_id: Uuid) -> std::result::Result<bool, VaultError> {
        let deleted = sqlx::query("DELETE FROM encrypted_credentials WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        Ok(deleted.rows_affected() > 0)
    }
}
