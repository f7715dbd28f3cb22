//! Velocity detector
//!
//! Flags automations whose event rate over the trailing hour exceeds the
//! organization baseline by the configured z-score.

use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{events_last_hour, DetectionWindow, Detector, PatternDraft};

/// Pre-baseline seed used until an organization baseline is learned
pub const DEFAULT_VELOCITY_MEAN: f64 = 10.0;
pub const DEFAULT_VELOCITY_STD: f64 = 2.0;

pub struct VelocityDetector;

impl Detector for VelocityDetector {
    fn name(&self) -> &'static str {
        "velocity"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::Velocity
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        baseline: Option<&BehavioralBaseline>,
        thresholds: &DetectorThresholds,
        _cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        let rate = events_last_hour(window.events, window.now) as f64;
        let (mean, std) = baseline
            .map(|b| (b.velocity_mean, b.velocity_std))
            .unwrap_or((DEFAULT_VELOCITY_MEAN, DEFAULT_VELOCITY_STD));
        if std <= 0.0 || rate <= mean {
            return vec![];
        }

        let z = (rate - mean) / std;
        if z < thresholds.velocity_z_score {
            return vec![];
        }

        // Severity escalates with how far past the threshold the spike is
        let magnitude = z / thresholds.velocity_z_score;
        let severity = if magnitude >= 4.0 {
            Severity::Critical
        } else if magnitude >= 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };

        vec![PatternDraft {
            pattern_type: PatternType::Velocity,
            confidence: (50.0 + z * 5.0).min(99.0),
            severity,
            evidence: serde_json::json!({
                "eventRate": format!("{}/hr", rate as u64),
                "baselineMean": mean,
                "baselineStd": std,
                "zScore": (z * 100.0).round() / 100.0,
            }),
        }]
    }
}
