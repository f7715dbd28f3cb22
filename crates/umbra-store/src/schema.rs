//! Relational schema
//!
//! Applied idempotently at startup. Discovery/detection JSON payloads are
//! stored opaquely (JSONB) so schema migrations stay additive.

use sqlx::PgPool;
use umbra_core::{Result, UmbraError};

/// DDL statements, in dependency order
pub const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS organizations (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        tier TEXT NOT NULL,
        settings JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS platform_connections (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        platform TEXT NOT NULL,
        platform_user_id TEXT NOT NULL,
        display_name TEXT,
        status TEXT NOT NULL,
        scopes JSONB NOT NULL,
        health JSONB NOT NULL,
        workspace JSONB NOT NULL,
        credentials_blocked BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (organization_id, platform, platform_user_id)
    )",
    r"CREATE INDEX IF NOT EXISTS idx_connections_org ON platform_connections (organization_id)",
    r"CREATE TABLE IF NOT EXISTS encrypted_credentials (
        connection_id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        ciphertext BYTEA NOT NULL,
        nonce BYTEA NOT NULL,
        wrapped_data_key BYTEA NOT NULL,
        wrap_nonce BYTEA NOT NULL,
        key_version INTEGER NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_credentials_org ON encrypted_credentials (organization_id)",
    r"CREATE TABLE IF NOT EXISTS discovery_runs (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        connection_id UUID NOT NULL,
        status TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        progress JSONB NOT NULL,
        warnings JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_runs_org ON discovery_runs (organization_id)",
    r"CREATE INDEX IF NOT EXISTS idx_runs_connection ON discovery_runs (connection_id, created_at DESC)",
    r"CREATE TABLE IF NOT EXISTS discovered_automations (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        connection_id UUID NOT NULL,
        discovery_run_id UUID NOT NULL,
        external_id TEXT NOT NULL,
        automation_type TEXT NOT NULL,
        name TEXT NOT NULL,
        platform TEXT NOT NULL,
        platform_metadata JSONB NOT NULL,
        permissions JSONB NOT NULL,
        owner TEXT,
        vendor_name TEXT,
        vendor_group TEXT,
        vendor_override BOOLEAN NOT NULL DEFAULT FALSE,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        first_discovered_at TIMESTAMPTZ NOT NULL,
        last_seen_at TIMESTAMPTZ NOT NULL,
        UNIQUE (connection_id, external_id)
    )",
    r"CREATE INDEX IF NOT EXISTS idx_automations_org ON discovered_automations (organization_id)",
    r"CREATE INDEX IF NOT EXISTS idx_automations_vendor ON discovered_automations (platform, vendor_name)",
    r"CREATE INDEX IF NOT EXISTS idx_automations_discovered ON discovered_automations (organization_id, first_discovered_at)",
    r"CREATE TABLE IF NOT EXISTS detection_patterns (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        automation_id UUID NOT NULL,
        pattern_type TEXT NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        severity TEXT NOT NULL,
        evidence JSONB NOT NULL,
        evidence_hash TEXT NOT NULL UNIQUE,
        detected_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_detections_org ON detection_patterns (organization_id)",
    r"CREATE INDEX IF NOT EXISTS idx_detections_automation ON detection_patterns (automation_id, detected_at DESC)",
    r"CREATE TABLE IF NOT EXISTS risk_assessments (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        automation_id UUID NOT NULL,
        risk_level TEXT NOT NULL,
        risk_score DOUBLE PRECISION NOT NULL,
        sub_scores JSONB NOT NULL,
        assessed_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_risk_org ON risk_assessments (organization_id)",
    r"CREATE INDEX IF NOT EXISTS idx_risk_automation ON risk_assessments (automation_id, assessed_at DESC)",
    r"CREATE TABLE IF NOT EXISTS automation_feedback (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        automation_id UUID NOT NULL,
        user_id TEXT NOT NULL,
        feedback_type TEXT NOT NULL,
        detection_snapshot JSONB NOT NULL,
        correction TEXT,
        features JSONB NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_feedback_org ON automation_feedback (organization_id, status)",
    r"CREATE TABLE IF NOT EXISTS behavioral_baselines (
        organization_id UUID PRIMARY KEY,
        baseline JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS detector_thresholds (
        organization_id UUID PRIMARY KEY,
        thresholds JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS correlation_chains (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        automation_ids JSONB NOT NULL,
        correlation_type TEXT NOT NULL,
        supporting JSONB NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        cross_platform_chain BOOLEAN NOT NULL,
        description TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_chains_org ON correlation_chains (organization_id)",
    r"CREATE TABLE IF NOT EXISTS chain_members (
        chain_id UUID NOT NULL,
        automation_id UUID NOT NULL,
        PRIMARY KEY (chain_id, automation_id)
    )",
    r"CREATE INDEX IF NOT EXISTS idx_chain_members_automation ON chain_members (automation_id)",
    r"CREATE TABLE IF NOT EXISTS audit_log (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        actor TEXT NOT NULL,
        resource TEXT NOT NULL,
        details JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_audit_org ON audit_log (organization_id, created_at DESC)",
    r"CREATE TABLE IF NOT EXISTS activity_events (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        connection_id UUID NOT NULL,
        automation_external_id TEXT,
        actor_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        target TEXT,
        bytes BIGINT,
        records BIGINT,
        occurred_at TIMESTAMPTZ NOT NULL,
        dedupe_key TEXT NOT NULL UNIQUE
    )",
    r"CREATE INDEX IF NOT EXISTS idx_activity_org ON activity_events (organization_id, occurred_at)",
    r"CREATE INDEX IF NOT EXISTS idx_activity_connection ON activity_events (connection_id, occurred_at)",
];

/// Apply the schema; safe to run on every startup
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| UmbraError::internal(format!("schema migration failed: {e}")))?;
    }
    tracing::info!("schema migration complete ({} statements)", SCHEMA.len());
    Ok(())
}
