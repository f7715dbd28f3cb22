//! Risk scorer
//!
//! Weighted combination of permission, data-access, activity, and ownership
//! sub-scores, floored by the worst detection pattern so a critical finding
//! can never hide under a quiet profile. Levels come from per-organization
//! thresholds.

use chrono::{DateTime, Utc};
use umbra_core::types::*;
use uuid::Uuid;

use crate::permission_escalation::is_sensitive;
use crate::PatternDraft;

const WEIGHT_PERMISSION: f64 = 0.30;
const WEIGHT_DATA_ACCESS: f64 = 0.25;
const WEIGHT_ACTIVITY: f64 = 0.25;
const WEIGHT_OWNERSHIP: f64 = 0.20;

/// Score floor applied per worst pattern severity
fn severity_floor(severity: Severity, confidence: f64) -> f64 {
    match severity {
        Severity::Critical => 90.0 + (confidence / 20.0).min(9.0),
        Severity::High => 70.0 + (confidence / 10.0).min(15.0),
        Severity::Medium => 45.0 + (confidence / 10.0).min(10.0),
        Severity::Low => 20.0,
    }
}

fn permission_score(automation: &DiscoveredAutomation) -> f64 {
    let count = automation.permissions.len() as f64;
    let sensitive = automation
        .permissions
        .iter()
        .filter(|s| is_sensitive(s))
        .count() as f64;
    (count * 4.0 + sensitive * 15.0).min(100.0)
}

fn data_access_score(automation: &DiscoveredAutomation, patterns: &[PatternDraft]) -> f64 {
    let mut score: f64 = match automation.automation_type {
        AutomationType::OauthApp | AutomationType::ServiceAccount => 35.0,
        AutomationType::Workflow | AutomationType::Script => 25.0,
        AutomationType::Bot | AutomationType::Webhook => 15.0,
    };
    if let Some(volume) = patterns
        .iter()
        .find(|p| p.pattern_type == PatternType::DataVolume)
    {
        score = score.max(volume.confidence);
    }
    if patterns
        .iter()
        .any(|p| p.pattern_type == PatternType::AiProvider)
    {
        // Data leaving for an AI provider is a data-access concern in itself
        score += 20.0;
    }
    score.min(100.0)
}

fn activity_score(patterns: &[PatternDraft]) -> f64 {
    const ACTIVITY_PATTERNS: &[PatternType] = &[
        PatternType::Velocity,
        PatternType::BatchOperation,
        PatternType::OffHours,
        PatternType::TimingVariance,
        PatternType::MlBehavioral,
        PatternType::CrossActorCoordination,
    ];
    // Patterns arrive sorted worst-first; the first activity pattern drives
    patterns
        .iter()
        .find(|p| ACTIVITY_PATTERNS.contains(&p.pattern_type))
        .map(|p| match p.severity {
            Severity::Critical => 100.0,
            Severity::High => 80.0,
            Severity::Medium => 55.0,
            Severity::Low => 30.0,
        })
        .unwrap_or(10.0)
}

fn ownership_score(automation: &DiscoveredAutomation) -> f64 {
    match (&automation.owner, automation.vendor_name.as_deref()) {
        // Orphaned automation from an unknown vendor is the worst case
        (None, None) => 85.0,
        (None, Some(_)) => 60.0,
        (Some(_), None) => 40.0,
        (Some(_), Some(_)) => 20.0,
    }
}

/// Sort patterns the way the scorer consumes them: severity first, then
/// confidence on ties
pub fn rank_patterns(patterns: &mut [PatternDraft]) {
    patterns.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });
}

/// Produce the assessment for one automation from this run's patterns
pub fn assess_risk(
    automation: &DiscoveredAutomation,
    patterns: &[PatternDraft],
    thresholds: &RiskThresholds,
    assessed_at: DateTime<Utc>,
) -> RiskAssessment {
    let mut ranked: Vec<PatternDraft> = patterns.to_vec();
    rank_patterns(&mut ranked);

    let sub_scores = RiskSubScores {
        permission: permission_score(automation),
        data_access: data_access_score(automation, &ranked),
        activity: activity_score(&ranked),
        ownership: ownership_score(automation),
    };
    let weighted = sub_scores.permission * WEIGHT_PERMISSION
        + sub_scores.data_access * WEIGHT_DATA_ACCESS
        + sub_scores.activity * WEIGHT_ACTIVITY
        + sub_scores.ownership * WEIGHT_OWNERSHIP;

    let floor = ranked
        .first()
        .map(|worst| severity_floor(worst.severity, worst.confidence))
        .unwrap_or(0.0);
    let risk_score = weighted.max(floor).min(100.0);

    RiskAssessment {
        id: Uuid::new_v4(),
        organization_id: automation.organization_id,
        automation_id: automation.id,
        risk_level: thresholds.level_for(risk_score),
        risk_score,
        sub_scores,
        assessed_at,
    }
}
