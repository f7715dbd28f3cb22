//! Umbra detection pipeline
//!
//! Eleven detectors run in declaration order over bounded event windows.
//! The first ten listed here are pure and synchronous; the qualitative
//! validator is asynchronous and optional. A detector failure is isolated to
//! a run warning and never aborts the run. Detectors never mutate inputs.

pub mod ai_provider;
pub mod baseline;
pub mod batch;
pub mod coordination;
pub mod data_volume;
pub mod ml_behavioral;
pub mod off_hours;
pub mod permission_escalation;
pub mod risk;
pub mod timing_variance;
pub mod validator;
pub mod velocity;

pub use baseline::BaselineEngine;
pub use risk::assess_risk;
pub use validator::QualitativeValidator;

use chrono::{DateTime, Utc};
use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

/// Everything a detector may look at for one automation
pub struct DetectionWindow<'a> {
    pub automation: &'a DiscoveredAutomation,
    /// Events attributed to this automation, ordered by `occurred_at`
    pub events: &'a [ActivityEvent],
    /// All organization events in the window, for cross-actor analysis
    pub org_events: &'a [ActivityEvent],
    /// Permission set recorded before this run
    pub known_permissions: &'a [String],
    pub now: DateTime<Utc>,
}

/// A detector's output before persistence identity is assigned
#[derive(Debug, Clone)]
pub struct PatternDraft {
    pub pattern_type: PatternType,
    /// Confidence in [0,100]
    pub confidence: f64,
    pub severity: Severity,
    pub evidence: serde_json::Value,
}

impl PatternDraft {
    /// Materialize into a persistable pattern
    pub fn into_pattern(
        self,
        organization_id: uuid::Uuid,
        automation_id: uuid::Uuid,
        detected_at: DateTime<Utc>,
    ) -> DetectionPattern {
        let evidence_hash = evidence_hash(automation_id, self.pattern_type, &self.evidence);
        DetectionPattern {
            id: uuid::Uuid::new_v4(),
            organization_id,
            automation_id,
            pattern_type: self.pattern_type,
            confidence: self.confidence,
            severity: self.severity,
            evidence: self.evidence,
            evidence_hash,
            detected_at,
        }
    }
}

/// A pure, synchronous pattern detector
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn pattern_type(&self) -> PatternType;
    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        baseline: Option<&BehavioralBaseline>,
        thresholds: &DetectorThresholds,
        cfg: &DetectorConfig,
    ) -> Vec<PatternDraft>;
}

/// The detector registry, in declaration order
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorSet {
    /// The standard set; order is load-bearing for pattern append order
    pub fn standard() -> Self {
        Self {
            detectors: vec![
                Box::new(velocity::VelocityDetector),
                Box::new(batch::BatchOperationDetector),
                Box::new(off_hours::OffHoursDetector),
                Box::new(timing_variance::TimingVarianceDetector),
                Box::new(permission_escalation::PermissionEscalationDetector),
                Box::new(data_volume::DataVolumeDetector),
                Box::new(ai_provider::AiProviderDetector),
                Box::new(ml_behavioral::MlBehavioralDetector),
                Box::new(coordination::CoordinationDetector),
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Run every detector over one window. Panics are contained per
    /// detector and surfaced as warnings; output order follows declaration
    /// order.
    pub fn detect_all(
        &self,
        window: &DetectionWindow<'_>,
        baseline: Option<&BehavioralBaseline>,
        thresholds: &DetectorThresholds,
        cfg: &DetectorConfig,
    ) -> (Vec<PatternDraft>, Vec<String>) {
        let mut drafts = Vec::new();
        let mut warnings = Vec::new();
        for detector in &self.detectors {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                detector.detect(window, baseline, thresholds, cfg)
            }));
            match result {
                Ok(mut found) => drafts.append(&mut found),
                Err(_) => {
                    tracing::error!(detector = detector.name(), "detector panicked; isolated");
                    warnings.push(format!("detector {} failed", detector.name()));
                }
            }
        }
        (drafts, warnings)
    }
}

/// Events per hour over the trailing hour of the window
pub(crate) fn events_last_hour(events: &[ActivityEvent], now: DateTime<Utc>) -> u64 {
    let cutoff = now - chrono::Duration::hours(1);
    events.iter().filter(|e| e.occurred_at >= cutoff).count() as u64
}

/// Mean and population standard deviation
pub(crate) fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use uuid::Uuid;

    pub fn automation(name: &str, permissions: &[&str]) -> DiscoveredAutomation {
        DiscoveredAutomation {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            discovery_run_id: Uuid::new_v4(),
            external_id: format!("ext-{name}"),
            automation_type: AutomationType::Bot,
            name: name.to_string(),
            platform: Platform::Slack,
            platform_metadata: serde_json::json!({}),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            owner: Some("owner@acme.com".to_string()),
            vendor_name: None,
            vendor_group: None,
            vendor_override: false,
            is_active: true,
            first_discovered_at: Utc::now() - chrono::Duration::days(30),
            last_seen_at: Utc::now(),
        }
    }

    pub fn event_at(automation: &DiscoveredAutomation, at: DateTime<Utc>) -> ActivityEvent {
        ActivityEvent {
            id: Uuid::new_v4(),
            organization_id: automation.organization_id,
            connection_id: automation.connection_id,
            automation_external_id: Some(automation.external_id.clone()),
            actor_id: automation.external_id.clone(),
            event_type: "message.post".to_string(),
            target: Some("channel:general".to_string()),
            bytes: None,
            records: None,
            occurred_at: at,
        }
    }

    pub fn baseline_with(mean: f64, std: f64, confidence: f64) -> BehavioralBaseline {
        BehavioralBaseline {
            organization_id: Uuid::new_v4(),
            velocity_mean: mean,
            velocity_std: std,
            business_window: BusinessWindow::default(),
            common_permissions: Default::default(),
            type_distribution: Default::default(),
            sample_size: 100,
            confidence,
            status: BaselineStatus::Established,
            last_updated: Utc::now(),
            next_update_due: Utc::now() + chrono::Duration::days(1),
        }
    }

    pub fn window<'a>(
        automation: &'a DiscoveredAutomation,
        events: &'a [ActivityEvent],
    ) -> DetectionWindow<'a> {
        DetectionWindow {
            automation,
            events,
            org_events: events,
            known_permissions: &[],
            now: Utc::now(),
        }
    }
}
