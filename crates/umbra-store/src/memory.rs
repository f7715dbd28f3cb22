//! In-memory backend
//!
//! Implements every repository contract over concurrent maps. Used by the
//! test suite and by database-less deployments; behavior matches the
//! Postgres backend including tenant scoping, dedupe, and terminal-run
//! immutability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use tokio::sync::RwLock;
use umbra_core::types::*;
use umbra_core::vendor;
use umbra_core::{Result, UmbraError};
use umbra_vault::{CredentialRecordRepo, VaultError};
use uuid::Uuid;

use crate::repos::*;

/// Shared in-memory state behind all repository traits
#[derive(Default)]
pub struct MemoryStore {
    orgs: DashMap<Uuid, Organization>,
    connections: DashMap<Uuid, PlatformConnection>,
    runs: DashMap<Uuid, DiscoveryRun>,
    automations: DashMap<Uuid, DiscoveredAutomation>,
    /// `(connection_id, external_id)` -> automation id
    automation_index: DashMap<(Uuid, String), Uuid>,
    detections: DashMap<Uuid, DetectionPattern>,
    detection_hashes: DashSet<String>,
    risks: DashMap<Uuid, RiskAssessment>,
    feedback: DashMap<Uuid, AutomationFeedback>,
    baselines: DashMap<Uuid, BehavioralBaseline>,
    thresholds: DashMap<Uuid, DetectorThresholds>,
    chains: DashMap<Uuid, CorrelationChain>,
    audit: RwLock<Vec<AuditLogEntry>>,
    activity: RwLock<Vec<ActivityEvent>>,
    activity_keys: DashSet<String>,
    credentials: DashMap<Uuid, EncryptedCredentialRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrganizationRepo for MemoryStore {
    async fn create(&self, org: Organization) -> Result<()> {
        if self.orgs.contains_key(&org.id) {
            return Err(UmbraError::Conflict {
                reason: format!("organization {} already exists", org.id),
            });
        }
        self.orgs.insert(org.id, org);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self.orgs.get(&id).map(|o| o.clone()))
    }

    async fn update_settings(&self, id: Uuid, settings: OrgSettings) -> Result<()> {
        let mut org = self
            .orgs
            .get_mut(&id)
            .ok_or_else(|| UmbraError::not_found(format!("organization {id}")))?;
        org.settings = settings;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Organization>> {
        Ok(self.orgs.iter().map(|o| o.clone()).collect())
    }
}

#[async_trait]
impl ConnectionRepo for MemoryStore {
    async fn insert(&self, conn: PlatformConnection) -> Result<()> {
        self.connections.insert(conn.id, conn);
        Ok(())
    }

    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<PlatformConnection>> {
        Ok(self
            .connections
            .get(&id)
            .filter(|c| c.organization_id == organization_id)
            .map(|c| c.clone()))
    }

    async fn get_any(&self, id: Uuid) -> Result<Option<PlatformConnection>> {
        Ok(self.connections.get(&id).map(|c| c.clone()))
    }

    async fn find_identity(
        &self,
        organization_id: Uuid,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Option<PlatformConnection>> {
        Ok(self
            .connections
            .iter()
            .find(|c| {
                c.organization_id == organization_id
                    && c.platform == platform
                    && c.platform_user_id == platform_user_id
            })
            .map(|c| c.clone()))
    }

    async fn list_for_org(&self, organization_id: Uuid) -> Result<Vec<PlatformConnection>> {
        let mut out: Vec<_> = self
            .connections
            .iter()
            .filter(|c| c.organization_id == organization_id)
            .map(|c| c.clone())
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn list_all(&self) -> Result<Vec<PlatformConnection>> {
        Ok(self.connections.iter().map(|c| c.clone()).collect())
    }

    async fn update(&self, conn: PlatformConnection) -> Result<()> {
        if !self.connections.contains_key(&conn.id) {
            return Err(UmbraError::not_found(format!("connection {}", conn.id)));
        }
        self.connections.insert(conn.id, conn);
        Ok(())
    }
}

#[async_trait]
impl TransitionRepo for MemoryStore {
    async fn apply_transition(
        &self,
        conn: PlatformConnection,
        change: CredentialChange,
    ) -> Result<()> {
        let connection_id = conn.id;
        self.connections.insert(connection_id, conn);
        match change {
            CredentialChange::Put(record) => {
                self.credentials.insert(connection_id, record);
            }
            CredentialChange::Delete => {
                self.credentials.remove(&connection_id);
            }
            CredentialChange::Keep => {}
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialRecordRepo for MemoryStore {
    async fn upsert(&self, record: EncryptedCredentialRecord) -> std::result::Result<(), VaultError> {
        self.credentials.insert(record.connection_id, record);
        Ok(())
    }

    async fn get(
        &self,
        connection_id: Uuid,
    ) -> std::result::Result<Option<EncryptedCredentialRecord>, VaultError> {
        Ok(self.credentials.get(&connection_id).map(|r| r.clone()))
    }

    async fn delete(&self, connection_id: Uuid) -> std::result::Result<bool, VaultError> {
        Ok(self.credentials.remove(&connection_id).is_some())
    }
}

#[async_trait]
impl RunRepo for MemoryStore {
    async fn insert(&self, run: DiscoveryRun) -> Result<()> {
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<DiscoveryRun>> {
        Ok(self
            .runs
            .get(&id)
            .filter(|r| r.organization_id == organization_id)
            .map(|r| r.clone()))
    }

    async fn update(&self, run: DiscoveryRun) -> Result<()> {
        let existing = self
            .runs
            .get(&run.id)
            .ok_or_else(|| UmbraError::not_found(format!("run {}", run.id)))?;
        if existing.status.is_terminal() {
            return Err(UmbraError::Conflict {
                reason: format!("run {} is terminal and immutable", run.id),
            });
        }
        drop(existing);
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn active_for_connection(&self, connection_id: Uuid) -> Result<Option<DiscoveryRun>> {
        Ok(self
            .runs
            .iter()
            .find(|r| r.connection_id == connection_id && !r.status.is_terminal())
            .map(|r| r.clone()))
    }

    async fn list_for_connection(&self, connection_id: Uuid, limit: u32) -> Result<Vec<DiscoveryRun>> {
        let mut out: Vec<_> = self
            .runs
            .iter()
            .filter(|r| r.connection_id == connection_id)
            .map(|r| r.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if limit > 0 {
            out.truncate(limit as usize);
        }
        Ok(out)
    }
}

#[async_trait]
impl AutomationRepo for MemoryStore {
    async fn upsert(
        &self,
        organization_id: Uuid,
        connection_id: Uuid,
        run_id: Uuid,
        platform: Platform,
        normalized: &NormalizedAutomation,
        now: DateTime<Utc>,
    ) -> Result<(DiscoveredAutomation, UpsertOutcome)> {
        let key = (connection_id, normalized.external_id.clone());
        let existing = self
            .automation_index
            .get(&key)
            .map(|e| *e)
            .and_then(|id| self.automations.get(&id).map(|a| a.clone()));

        let outcome = if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };
        let merged = merge_normalized(
            existing.as_ref(),
            organization_id,
            connection_id,
            run_id,
            platform,
            normalized,
            now,
        );
        self.automation_index.insert(key, merged.id);
        self.automations.insert(merged.id, merged.clone());
        Ok((merged, outcome))
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
        let (automation, outcome) = AutomationRepo::upsert(
            self,
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
        RiskRepo::insert(self, assessment).await?;
        Ok((automation, outcome))
    }

    async fn get(&self, organization_id: Uuid, id: Uuid) -> Result<Option<DiscoveredAutomation>> {
        Ok(self
            .automations
            .get(&id)
            .filter(|a| a.organization_id == organization_id)
            .map(|a| a.clone()))
    }

    async fn find_by_external(
        &self,
        connection_id: Uuid,
        external_id: &str,
    ) -> Result<Option<DiscoveredAutomation>> {
        Ok(self
            .automation_index
            .get(&(connection_id, external_id.to_string()))
            .map(|e| *e)
            .and_then(|id| self.automations.get(&id).map(|a| a.clone())))
    }

    async fn list(&self, organization_id: Uuid, filter: &AutomationFilter) -> Result<Vec<DiscoveredAutomation>> {
        let mut out: Vec<_> = self
            .automations
            .iter()
            .filter(|a| a.organization_id == organization_id)
            .filter(|a| filter.include_inactive || a.is_active)
            .filter(|a| filter.platform.map_or(true, |p| a.platform == p))
            .filter(|a| {
                filter
                    .discovered_after
                    .map_or(true, |cut| a.first_discovered_at >= cut)
            })
            .map(|a| a.clone())
            .collect();
        out.sort_by(|a, b| {
            b.first_discovered_at
                .cmp(&a.first_discovered_at)
                .then(a.id.cmp(&b.id))
        });
        if filter.limit > 0 {
            let start = (filter.page as usize).saturating_mul(filter.limit as usize);
            out = out.into_iter().skip(start).take(filter.limit as usize).collect();
        }
        Ok(out)
    }

    async fn deactivate_unseen(
        &self,
        connection_id: Uuid,
        run_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut count = 0u64;
        for mut a in self.automations.iter_mut() {
            if a.connection_id == connection_id
                && a.discovery_run_id != run_id
                && a.is_active
                && a.last_seen_at < cutoff
            {
                a.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn override_vendor(
        &self,
        organization_id: Uuid,
        id: Uuid,
        vendor_name: Option<String>,
    ) -> Result<DiscoveredAutomation> {
        let mut a = self
            .automations
            .get_mut(&id)
            .filter(|a| a.organization_id == organization_id)
            .ok_or_else(|| UmbraError::not_found(format!("automation {id}")))?;
        a.vendor_override = vendor_name.is_some();
        a.vendor_group = vendor::vendor_group(vendor_name.as_deref(), a.platform);
        a.vendor_name = vendor_name;
        Ok(a.clone())
    }
}

#[async_trait]
impl DetectionRepo for MemoryStore {
    async fn insert_if_new(&self, pattern: DetectionPattern) -> Result<bool> {
        if !self.detection_hashes.insert(pattern.evidence_hash.clone()) {
            return Ok(false);
        }
        self.detections.insert(pattern.id, pattern);
        Ok(true)
    }

    async fn list_for_automation(
        &self,
        organization_id: Uuid,
        automation_id: Uuid,
        limit: u32,
    ) -> Result<Vec<DetectionPattern>> {
        let mut out: Vec<_> = self
            .detections
            .iter()
            .filter(|d| d.organization_id == organization_id && d.automation_id == automation_id)
            .map(|d| d.clone())
            .collect();
        out.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        if limit > 0 {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn list_since(&self, organization_id: Uuid, since: DateTime<Utc>) -> Result<Vec<DetectionPattern>> {
        let mut out: Vec<_> = self
            .detections
            .iter()
            .filter(|d| d.organization_id == organization_id && d.detected_at >= since)
            .map(|d| d.clone())
            .collect();
        out.sort_by_key(|d| d.detected_at);
        Ok(out)
    }
}

#[async_trait]
impl RiskRepo for MemoryStore {
    async fn insert(&self, assessment: RiskAssessment) -> Result<()> {
        self.risks.insert(assessment.id, assessment);
        Ok(())
    }

    async fn current_for_automation(
        &self,
        organization_id: Uuid,
        automation_id: Uuid,
    ) -> Result<Option<RiskAssessment>> {
        Ok(self
            .risks
            .iter()
            .filter(|r| r.organization_id == organization_id && r.automation_id == automation_id)
            .max_by_key(|r| r.assessed_at)
            .map(|r| r.clone()))
    }

    async fn current_for_org(&self, organization_id: Uuid) -> Result<HashMap<Uuid, RiskAssessment>> {
        let mut current: HashMap<Uuid, RiskAssessment> = HashMap::new();
        for r in self.risks.iter() {
            if r.organization_id != organization_id {
                continue;
            }
            match current.get(&r.automation_id) {
                Some(held) if held.assessed_at >= r.assessed_at => {}
                _ => {
                    current.insert(r.automation_id, r.clone());
                }
            }
        }
        Ok(current)
    }
}

#[async_trait]
impl FeedbackRepo for MemoryStore {
    async fn insert(&self, feedback: AutomationFeedback) -> Result<()> {
        self.feedback.insert(feedback.id, feedback);
        Ok(())
    }

    async fn list_pending(&self, organization_id: Uuid) -> Result<Vec<AutomationFeedback>> {
        let mut out: Vec<_> = self
            .feedback
            .iter()
            .filter(|f| f.organization_id == organization_id && f.status == FeedbackStatus::Pending)
            .map(|f| f.clone())
            .collect();
        out.sort_by_key(|f| f.created_at);
        Ok(out)
    }

    async fn mark_applied(&self, organization_id: Uuid, ids: &[Uuid]) -> Result<()> {
        for id in ids {
            if let Some(mut f) = self.feedback.get_mut(id) {
                if f.organization_id == organization_id {
                    f.status = FeedbackStatus::Applied;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BaselineRepo for MemoryStore {
    async fn get(&self, organization_id: Uuid) -> Result<Option<BehavioralBaseline>> {
        Ok(self.baselines.get(&organization_id).map(|b| b.clone()))
    }

    async fn upsert(&self, baseline: BehavioralBaseline) -> Result<()> {
        self.baselines.insert(baseline.organization_id, baseline);
        Ok(())
    }

    async fn thresholds(&self, organization_id: Uuid) -> Result<DetectorThresholds> {
        Ok(self
            .thresholds
            .get(&organization_id)
            .map(|t| t.clone())
            .unwrap_or_default())
    }

    async fn put_thresholds(&self, organization_id: Uuid, thresholds: DetectorThresholds) -> Result<()> {
        self.thresholds.insert(organization_id, thresholds);
        Ok(())
    }
}

#[async_trait]
impl ChainRepo for MemoryStore {
    async fn replace_touching(
        &self,
        organization_id: Uuid,
        touched: &[Uuid],
        chains: Vec<CorrelationChain>,
    ) -> Result<()> {
        let stale: Vec<Uuid> = self
            .chains
            .iter()
            .filter(|c| {
                c.organization_id == organization_id
                    && c.automation_ids.iter().any(|id| touched.contains(id))
            })
            .map(|c| c.id)
            .collect();
        for id in stale {
            self.chains.remove(&id);
        }
        for chain in chains {
            self.chains.insert(chain.id, chain);
        }
        Ok(())
    }

    async fn list_for_org(&self, organization_id: Uuid) -> Result<Vec<CorrelationChain>> {
        let mut out: Vec<_> = self
            .chains
            .iter()
            .filter(|c| c.organization_id == organization_id)
            .map(|c| c.clone())
            .collect();
        out.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }
}

#[async_trait]
impl AuditRepo for MemoryStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<()> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn list_recent(&self, organization_id: Uuid, limit: u32) -> Result<Vec<AuditLogEntry>> {
        let audit = self.audit.read().await;
        let mut out: Vec<_> = audit
            .iter()
            .filter(|e| e.organization_id == organization_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if limit > 0 {
            out.truncate(limit as usize);
        }
        Ok(out)
    }
}

#[async_trait]
impl ActivityRepo for MemoryStore {
    async fn insert_batch(&self, events: Vec<ActivityEvent>) -> Result<()> {
        let mut activity = self.activity.write().await;
        for event in events {
            if self.activity_keys.insert(activity_dedupe_key(&event)) {
                activity.push(event);
            }
        }
        Ok(())
    }

    async fn window(
        &self,
        organization_id: Uuid,
        connection_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>> {
        let activity = self.activity.read().await;
        let mut out: Vec<_> = activity
            .iter()
            .filter(|e| e.organization_id == organization_id)
            .filter(|e| connection_id.map_or(true, |c| e.connection_id == c))
            .filter(|e| e.occurred_at >= since)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.occurred_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(external_id: &str, name: &str) -> NormalizedAutomation {
        NormalizedAutomation {
            external_id: external_id.to_string(),
            automation_type: AutomationType::Bot,
            name: name.to_string(),
            platform_metadata: serde_json::json!({}),
            permissions: vec!["chat:write".to_string()],
            owner: None,
            vendor_name: umbra_core::vendor::extract_vendor_name(name),
        }
    }

    #[tokio::test]
    async fn upsert_deduplicates_by_connection_and_external_id() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let run1 = Uuid::new_v4();
        let run2 = Uuid::new_v4();
        let now = Utc::now();

        let (first, outcome1) = AutomationRepo::upsert(&store, org, conn, run1, Platform::Slack, &normalized("B123", "Zapier Bot"), now)
            .await
            .unwrap();
        assert_eq!(outcome1, UpsertOutcome::Inserted);

        let later = now + chrono::Duration::hours(1);
        let (second, outcome2) = AutomationRepo::upsert(&store, org, conn, run2, Platform::Slack, &normalized("B123", "Zapier Bot v2"), later)
            .await
            .unwrap();
        assert_eq!(outcome2, UpsertOutcome::Updated);
        assert_eq!(second.id, first.id);
        assert_eq!(second.first_discovered_at, first.first_discovered_at);
        assert_eq!(second.last_seen_at, later);
        assert_eq!(second.name, "Zapier Bot v2");
    }

    #[tokio::test]
    async fn list_is_tenant_scoped() {
        let store = MemoryStore::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let now = Utc::now();

        AutomationRepo::upsert(&store, org_a, Uuid::new_v4(), Uuid::new_v4(), Platform::Slack, &normalized("A", "Bot A"), now)
            .await
            .unwrap();
        AutomationRepo::upsert(&store, org_b, Uuid::new_v4(), Uuid::new_v4(), Platform::Google, &normalized("B", "Bot B"), now)
            .await
            .unwrap();

        let listed = AutomationRepo::list(&store, org_a, &AutomationFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.iter().all(|a| a.organization_id == org_a));
    }

    #[tokio::test]
    async fn terminal_runs_reject_updates() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let mut run = DiscoveryRun {
            id: Uuid::new_v4(),
            organization_id: org,
            connection_id: Uuid::new_v4(),
            status: RunStatus::Running,
            trigger: RunTrigger::Manual,
            started_at: Some(Utc::now()),
            completed_at: None,
            progress: RunProgress::default(),
            warnings: vec![],
            created_at: Utc::now(),
        };
        RunRepo::insert(&store, run.clone()).await.unwrap();

        run.status = RunStatus::Succeeded;
        run.completed_at = Some(Utc::now());
        RunRepo::update(&store, run.clone()).await.unwrap();

        run.status = RunStatus::Failed;
        let err = RunRepo::update(&store, run).await.unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[tokio::test]
    async fn detection_insert_skips_identical_evidence() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let automation = Uuid::new_v4();
        let evidence = serde_json::json!({"eventRate": 200});
        let hash = evidence_hash(automation, PatternType::Velocity, &evidence);

        let make = || DetectionPattern {
            id: Uuid::new_v4(),
            organization_id: org,
            automation_id: automation,
            pattern_type: PatternType::Velocity,
            confidence: 95.0,
            severity: Severity::Critical,
            evidence: evidence.clone(),
            evidence_hash: hash.clone(),
            detected_at: Utc::now(),
        };

        assert!(store.insert_if_new(make()).await.unwrap());
        assert!(!store.insert_if_new(make()).await.unwrap());
        assert_eq!(store.list_for_automation(org, automation, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn current_risk_is_latest_assessment() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let automation = Uuid::new_v4();
        let now = Utc::now();

        for (score, offset) in [(30.0, 2), (80.0, 0), (55.0, 1)] {
            RiskRepo::insert(
                &store,
                RiskAssessment {
                    id: Uuid::new_v4(),
                    organization_id: org,
                    automation_id: automation,
                    risk_level: Severity::Medium,
                    risk_score: score,
                    sub_scores: RiskSubScores::default(),
                    assessed_at: now - chrono::Duration::hours(offset),
                })
                .await
                .unwrap();
        }

        let current = RiskRepo::current_for_automation(&store, org, automation).await.unwrap().unwrap();
        assert_eq!(current.risk_score, 80.0);
    }

    #[tokio::test]
    async fn deactivate_unseen_respects_grace_window() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let old_run = Uuid::new_v4();
        let new_run = Uuid::new_v4();
        let old = Utc::now() - chrono::Duration::days(7);

        AutomationRepo::upsert(&store, org, conn, old_run, Platform::Slack, &normalized("stale", "Stale Bot"), old)
            .await
            .unwrap();
        AutomationRepo::upsert(&store, org, conn, new_run, Platform::Slack, &normalized("fresh", "Fresh Bot"), Utc::now())
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(72);
        let deactivated = store.deactivate_unseen(conn, new_run, cutoff).await.unwrap();
        assert_eq!(deactivated, 1);

        let active = AutomationRepo::list(&store, org, &AutomationFilter::default()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_id, "fresh");
        // Soft-expired rows stay queryable when asked for
        let all = AutomationRepo::list(
                &store,
                org,
                &AutomationFilter {
                    include_inactive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn vendor_override_is_sticky_across_upserts() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let now = Utc::now();

        let (a, _) = AutomationRepo::upsert(&store, org, conn, Uuid::new_v4(), Platform::Google, &normalized("X1", "Attio CRM"), now)
            .await
            .unwrap();
        assert_eq!(a.vendor_name.as_deref(), Some("Attio"));

        store
            .override_vendor(org, a.id, Some("AttioHQ".to_string()))
            .await
            .unwrap();

        let (after, _) = AutomationRepo::upsert(&store, org, conn, Uuid::new_v4(), Platform::Google, &normalized("X1", "Attio CRM"), now)
            .await
            .unwrap();
        assert_eq!(after.vendor_name.as_deref(), Some("AttioHQ"));
        assert_eq!(after.vendor_group.as_deref(), Some("attiohq-google"));
    }

    #[tokio::test]
    async fn transition_applies_connection_and_credentials_together() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let conn = PlatformConnection {
            id: Uuid::new_v4(),
            organization_id: org,
            platform: Platform::Slack,
            platform_user_id: "u1".to_string(),
            display_name: None,
            status: ConnectionStatus::Connected,
            scopes: vec![],
            health: ConnectionHealth::default(),
            workspace: serde_json::json!({}),
            credentials_blocked: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let record = EncryptedCredentialRecord {
            connection_id: conn.id,
            organization_id: org,
            ciphertext: vec![1, 2, 3],
            nonce: vec![0; 12],
            wrapped_data_key: vec![4, 5, 6],
            wrap_nonce: vec![0; 12],
            key_version: 1,
            updated_at: Utc::now(),
        };

        store
            .apply_transition(conn.clone(), CredentialChange::Put(record))
            .await
            .unwrap();
        assert!(ConnectionRepo::get(&store, org, conn.id).await.unwrap().is_some());
        assert!(CredentialRecordRepo::get(&store, conn.id).await.unwrap().is_some());

        // Disconnect removes both sides of the pair in the same unit
        let mut disconnected = conn.clone();
        disconnected.status = ConnectionStatus::Disconnected;
        store
            .apply_transition(disconnected, CredentialChange::Delete)
            .await
            .unwrap();
        let reloaded = ConnectionRepo::get(&store, org, conn.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ConnectionStatus::Disconnected);
        assert!(CredentialRecordRepo::get(&store, conn.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_with_assessment_commits_the_pair_and_fixes_ids() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let now = Utc::now();

        // Placeholder ids; the repository rewrites them to the upserted row
        let assessment = RiskAssessment {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            automation_id: Uuid::new_v4(),
            risk_level: Severity::High,
            risk_score: 72.0,
            sub_scores: RiskSubScores::default(),
            assessed_at: now,
        };
        let (automation, outcome) = store
            .upsert_with_assessment(
                org,
                conn,
                Uuid::new_v4(),
                Platform::Slack,
                &normalized("B1", "Zapier Bot"),
                assessment,
                now,
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let current = RiskRepo::current_for_automation(&store, org, automation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.automation_id, automation.id);
        assert_eq!(current.organization_id, org);
        assert_eq!(current.risk_score, 72.0);
    }

    #[tokio::test]
    async fn chain_replacement_invalidates_touching_chains() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let chain = |members: Vec<Uuid>| CorrelationChain {
            id: Uuid::new_v4(),
            organization_id: org,
            automation_ids: members,
            correlation_type: CorrelationType::SimilarTiming,
            supporting: vec![],
            confidence: 0.8,
            cross_platform_chain: false,
            description: "test chain".to_string(),
            created_at: Utc::now(),
        };

        store.replace_touching(org, &[], vec![chain(vec![a]), chain(vec![b])]).await.unwrap();
        assert_eq!(ChainRepo::list_for_org(&store, org).await.unwrap().len(), 2);

        // Re-correlating automations touching `a` drops only its chain
        store.replace_touching(org, &[a], vec![chain(vec![a, b])]).await.unwrap();
        let chains = ChainRepo::list_for_org(&store, org).await.unwrap();
        assert_eq!(chains.len(), 2);
        assert!(chains.iter().any(|c| c.automation_ids == vec![a, b]));
    }
}
