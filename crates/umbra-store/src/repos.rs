//! Repository contracts
//!
//! Every read is scoped by `organization_id`; a row can only be reached
//! through its owning tenant. Both backends implement these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use umbra_core::types::*;
use umbra_core::Result;
use uuid::Uuid;

/// Whether an upsert created or refreshed a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Credential side of a connection state transition
#[derive(Debug, Clone)]
pub enum CredentialChange {
    /// Write this ciphertext record alongside the transition
    Put(EncryptedCredentialRecord),
    /// Remove the connection's credentials alongside the transition
    Delete,
    /// Transition only; credentials untouched
    Keep,
}

/// The merge an automation upsert applies, as a pure function. Both
/// backends and upsert previews share these semantics: identity and
/// `first_discovered_at` survive, mutable fields refresh, operator vendor
/// overrides stick.
pub fn merge_normalized(
    existing: Option<&DiscoveredAutomation>,
    organization_id: Uuid,
    connection_id: Uuid,
    run_id: Uuid,
    platform: Platform,
    normalized: &NormalizedAutomation,
    now: DateTime<Utc>,
) -> DiscoveredAutomation {
    use umbra_core::vendor;

    let (vendor_name, vendor_group, vendor_override) = match existing {
        Some(prior) if prior.vendor_override => (
            prior.vendor_name.clone(),
            prior.vendor_group.clone(),
            true,
        ),
        _ => (
            normalized.vendor_name.clone(),
            vendor::vendor_group(normalized.vendor_name.as_deref(), platform),
            false,
        ),
    };

    DiscoveredAutomation {
        id: existing.map(|a| a.id).unwrap_or_else(Uuid::new_v4),
        organization_id,
        connection_id,
        discovery_run_id: run_id,
        external_id: normalized.external_id.clone(),
        automation_type: normalized.automation_type,
        name: normalized.name.clone(),
        platform,
        platform_metadata: normalized.platform_metadata.clone(),
        permissions: normalized.permissions.clone(),
        owner: normalized.owner.clone(),
        vendor_name,
        vendor_group,
        vendor_override,
        is_active: true,
        first_discovered_at: existing
            .map(|a| a.first_discovered_at)
            .unwrap_or(now),
        last_seen_at: now,
    }
}

/// Filter for automation list queries. `limit == 0` means unbounded.
#[derive(Debug, Clone, Default)]
pub struct AutomationFilter {
    pub platform: Option<Platform>,
    pub include_inactive: bool,
    pub discovered_after: Option<DateTime<Utc>>,
    pub page: u32,
    pub limit: u32,
}

#[async_trait]
pub trait OrganizationRepo: Send + Sync {
    async fn create(&self, org: Organization) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Organization>>;
    async fn update_settings(&self, id: Uuid, settings: OrgSettings) -> Result<()>;
    async fn list(&self) -> Result<Vec<Organization>>;
}

#[async_trait]
pub trait ConnectionRepo: Send + Sync {
    async fn insert(&self, conn: PlatformConnection) -> Result<()>;
    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<PlatformConnection>>;
    /// Unscoped lookup for internal schedulers; never exposed through the API
    async fn get_any(&self, id: Uuid) -> Result<Option<PlatformConnection>>;
    async fn find_identity(
        &self,
        organization_id: Uuid,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Option<PlatformConnection>>;
    async fn list_for_org(&self, organization_id: Uuid) -> Result<Vec<PlatformConnection>>;
    async fn list_all(&self) -> Result<Vec<PlatformConnection>>;
    async fn update(&self, conn: PlatformConnection) -> Result<()>;
}

#[async_trait]
pub trait TransitionRepo: Send + Sync {
    /// Persist a connection state transition together with its credential
    /// change in a single transactional unit. A crash can never leave the
    /// connection row and the ciphertext row disagreeing.
    async fn apply_transition(
        &self,
        conn: PlatformConnection,
        change: CredentialChange,
    ) -> Result<()>;
}

#[async_trait]
pub trait RunRepo: Send + Sync {
    async fn insert(&self, run: DiscoveryRun) -> Result<()>;
    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<DiscoveryRun>>;
    /// Rejects writes against a terminal run
    async fn update(&self, run: DiscoveryRun) -> Result<()>;
    async fn active_for_connection(&self, connection_id: Uuid) -> Result<Option<DiscoveryRun>>;
    async fn list_for_connection(&self, connection_id: Uuid, limit: u32) -> Result<Vec<DiscoveryRun>>;
}

#[async_trait]
pub trait AutomationRepo: Send + Sync {
    /// Insert-or-refresh by `(connection_id, external_id)`. Updates mutable
    /// fields and `last_seen_at`; preserves `first_discovered_at` and any
    /// operator vendor override.
    async fn upsert(
        &self,
        organization_id: Uuid,
        connection_id: Uuid,
        run_id: Uuid,
        platform: Platform,
        normalized: &NormalizedAutomation,
        now: DateTime<Utc>,
    ) -> Result<(DiscoveredAutomation, UpsertOutcome)>;

    /// Upsert by `(connection_id, external_id)` and append the run's risk
    /// assessment in the same transaction, so readers never observe the
    /// refreshed automation without its assessment. The assessment's
    /// `automation_id` and `organization_id` are rewritten to the upserted
    /// row before the insert.
    async fn upsert_with_assessment(
        &self,
        organization_id: Uuid,
        connection_id: Uuid,
        run_id: Uuid,
        platform: Platform,
        normalized: &NormalizedAutomation,
        assessment: RiskAssessment,
        now: DateTime<Utc>,
    ) -> Result<(DiscoveredAutomation, UpsertOutcome)>;

    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<DiscoveredAutomation>>;
    /// Lookup by platform-native identity; the engine previews upsert
    /// merges against this row before detectors run
    async fn find_by_external(
        &self,
        connection_id: Uuid,
        external_id: &str,
    ) -> Result<Option<DiscoveredAutomation>>;
    async fn list(&self, organization_id: Uuid, filter: &AutomationFilter) -> Result<Vec<DiscoveredAutomation>>;

    /// Soft-expire automations on this connection not seen by `run_id` whose
    /// `last_seen_at` predates `cutoff`. Returns the number deactivated.
    async fn deactivate_unseen(
        &self,
        connection_id: Uuid,
        run_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    /// Maintenance operation: operator-supplied vendor name, sticky until
    /// cleared
    async fn override_vendor(
        &self,
        organization_id: Uuid,
        id: Uuid,
        vendor_name: Option<String>,
    ) -> Result<DiscoveredAutomation>;
}

#[async_trait]
pub trait DetectionRepo: Send + Sync {
    /// Append a pattern unless an identical one (same automation, type, and
    /// evidence hash) already exists. Returns true when inserted.
    async fn insert_if_new(&self, pattern: DetectionPattern) -> Result<bool>;
    async fn list_for_automation(
        &self,
        organization_id: Uuid,
        automation_id: Uuid,
        limit: u32,
    ) -> Result<Vec<DetectionPattern>>;
    async fn list_since(&self, organization_id: Uuid, since: DateTime<Utc>) -> Result<Vec<DetectionPattern>>;
}

#[async_trait]
pub trait RiskRepo: Send + Sync {
    async fn insert(&self, assessment: RiskAssessment) -> Result<()>;
    /// The assessment with the greatest `assessed_at` is current
    async fn current_for_automation(
        &self,
        organization_id: Uuid,
        automation_id: Uuid,
    ) -> Result<Option<RiskAssessment>>;
    async fn current_for_org(&self, organization_id: Uuid) -> Result<HashMap<Uuid, RiskAssessment>>;
}

#[async_trait]
pub trait FeedbackRepo: Send + Sync {
    async fn insert(&self, feedback: AutomationFeedback) -> Result<()>;
    async fn list_pending(&self, organization_id: Uuid) -> Result<Vec<AutomationFeedback>>;
    async fn mark_applied(&self, organization_id: Uuid, ids: &[Uuid]) -> Result<()>;
}

#[async_trait]
pub trait BaselineRepo: Send + Sync {
    async fn get(&self, organization_id: Uuid) -> Result<Option<BehavioralBaseline>>;
    async fn upsert(&self, baseline: BehavioralBaseline) -> Result<()>;
    async fn thresholds(&self, organization_id: Uuid) -> Result<DetectorThresholds>;
    async fn put_thresholds(&self, organization_id: Uuid, thresholds: DetectorThresholds) -> Result<()>;
}

#[async_trait]
pub trait ChainRepo: Send + Sync {
    /// Invalidate chains touching any of `touched`, then write replacements
    async fn replace_touching(
        &self,
        organization_id: Uuid,
        touched: &[Uuid],
        chains: Vec<CorrelationChain>,
    ) -> Result<()>;
    async fn list_for_org(&self, organization_id: Uuid) -> Result<Vec<CorrelationChain>>;
}

#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn append(&self, entry: AuditLogEntry) -> Result<()>;
    async fn list_recent(&self, organization_id: Uuid, limit: u32) -> Result<Vec<AuditLogEntry>>;
}

/// Content identity of an activity event; re-observing the same upstream
/// event on a later run must not duplicate the row
pub fn activity_dedupe_key(event: &ActivityEvent) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        event.connection_id,
        event.actor_id,
        event.event_type,
        event.occurred_at.timestamp_millis(),
        event.target.as_deref().unwrap_or("")
    )
}

#[async_trait]
pub trait ActivityRepo: Send + Sync {
    /// Insert events, skipping any whose dedupe key is already present
    async fn insert_batch(&self, events: Vec<ActivityEvent>) -> Result<()>;
    /// Events for detector windows, newest last
    async fn window(
        &self,
        organization_id: Uuid,
        connection_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>>;
}
