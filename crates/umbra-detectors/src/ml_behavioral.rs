//! ML-behavioral detector
//!
//! Expresses how far an automation sits from the organization baseline as a
//! normalized anomaly score in [0,1]. Without an established baseline the
//! score degrades to neutral and no pattern is emitted.

use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{events_last_hour, DetectionWindow, Detector, PatternDraft};

/// Score above which a pattern is emitted
const ANOMALY_FLOOR: f64 = 0.6;
/// Neutral score reported while the baseline is still learning
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Compute the anomaly score for a window against a baseline
pub fn anomaly_score(
    window: &DetectionWindow<'_>,
    baseline: &BehavioralBaseline,
) -> (f64, serde_json::Value) {
    // Velocity deviation, squashed into [0,1]
    let rate = events_last_hour(window.events, window.now) as f64;
    let velocity_component = if baseline.velocity_std > 0.0 {
        let z = ((rate - baseline.velocity_mean) / baseline.velocity_std).abs();
        (z / 6.0).min(1.0)
    } else {
        0.0
    };

    // How unusual this automation type is for the organization
    let type_share = baseline
        .type_distribution
        .get(window.automation.automation_type.as_str())
        .copied()
        .unwrap_or(0.0);
    let type_component = 1.0 - type_share.min(1.0);

    // Fraction of scopes the organization has never commonly granted
    let permission_component = if window.automation.permissions.is_empty() {
        0.0
    } else {
        let unusual = window
            .automation
            .permissions
            .iter()
            .filter(|scope| {
                baseline
                    .common_permissions
                    .get(*scope)
                    .copied()
                    .unwrap_or(0.0)
                    < 0.05
            })
            .count();
        unusual as f64 / window.automation.permissions.len() as f64
    };

    // Share of activity outside the learned business window
    let off_hours_component = if window.events.is_empty() {
        0.0
    } else {
        let outside = window
            .events
            .iter()
            .filter(|e| !baseline.business_window.contains(e.occurred_at))
            .count();
        outside as f64 / window.events.len() as f64
    };

    let score = velocity_component * 0.35
        + type_component * 0.15
        + permission_component * 0.25
        + off_hours_component * 0.25;
    let components = serde_json::json!({
        "velocity": (velocity_component * 100.0).round() / 100.0,
        "typeRarity": (type_component * 100.0).round() / 100.0,
        "permissionRarity": (permission_component * 100.0).round() / 100.0,
        "offHours": (off_hours_component * 100.0).round() / 100.0,
    });
    (score.min(1.0), components)
}

pub struct MlBehavioralDetector;

impl Detector for MlBehavioralDetector {
    fn name(&self) -> &'static str {
        "ml_behavioral"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::MlBehavioral
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        baseline: Option<&BehavioralBaseline>,
        _thresholds: &DetectorThresholds,
        _cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        let Some(baseline) = baseline else {
            return vec![];
        };
        if baseline.status != BaselineStatus::Established {
            return vec![];
        }

        let (score, components) = anomaly_score(window, baseline);
        if score < ANOMALY_FLOOR {
            return vec![];
        }

        let severity = if score >= 0.85 {
            Severity::High
        } else {
            Severity::Medium
        };
        vec![PatternDraft {
            pattern_type: PatternType::MlBehavioral,
            confidence: (score * 100.0).min(95.0),
            severity,
            evidence: serde_json::json!({
                "anomalyScore": (score * 1000.0).round() / 1000.0,
                "components": components,
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn anomalous_automation_scores_high() {
        let automation = automation("rogue", &["admin:everything", "exotic:scope"]);
        // Night-time burst against a 10/hr baseline
        let base = Utc.with_ymd_and_hms(2026, 7, 1, 2, 0, 0).unwrap();
        let events: Vec<_> = (0..120)
            .map(|i| event_at(&automation, base + chrono::Duration::seconds(i * 10)))
            .collect();
        let window = DetectionWindow {
            automation: &automation,
            events: &events,
            org_events: &events,
            known_permissions: &[],
            now: base + chrono::Duration::minutes(30),
        };
        let baseline = baseline_with(10.0, 2.0, 0.9);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = MlBehavioralDetector.detect(&window, Some(&baseline), &DetectorThresholds::default(), &cfg);
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].evidence["anomalyScore"].as_f64().unwrap() >= 0.6);
    }

    #[test]
    fn learning_baseline_emits_nothing() {
        let automation = automation("anything", &["admin:everything"]);
        let window = window(&automation, &[]);
        let mut baseline = baseline_with(10.0, 2.0, 0.3);
        baseline.status = BaselineStatus::Learning;
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        assert!(MlBehavioralDetector
            .detect(&window, Some(&baseline), &DetectorThresholds::default(), &cfg)
            .is_empty());
    }

    #[test]
    fn typical_automation_scores_low() {
        let mut baseline = baseline_with(10.0, 2.0, 0.9);
        baseline
            .type_distribution
            .insert("bot".to_string(), 0.8);
        baseline
            .common_permissions
            .insert("chat:write".to_string(), 0.6);
        let automation = automation("normal bot", &["chat:write"]);
        // Daytime, baseline-rate activity
        let base = Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap();
        let events: Vec<_> = (0..9)
            .map(|i| event_at(&automation, base + chrono::Duration::minutes(i * 6)))
            .collect();
        let window = DetectionWindow {
            automation: &automation,
            events: &events,
            org_events: &events,
            known_permissions: &[],
            now: base + chrono::Duration::hours(1),
        };

        let (score, _) = anomaly_score(&window, &baseline);
        assert!(score < 0.4, "expected low score, got {score}");
    }
}
