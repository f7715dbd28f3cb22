//! Timing-variance detector
//!
//! A coefficient of variation near zero over many inter-arrival intervals
//! means machine-scheduled traffic; humans are never that regular.

use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{mean_std, DetectionWindow, Detector, PatternDraft};

/// Minimum events before inter-arrival statistics mean anything
const MIN_EVENTS: usize = 20;

pub struct TimingVarianceDetector;

impl Detector for TimingVarianceDetector {
    fn name(&self) -> &'static str {
        "timing_variance"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::TimingVariance
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        _baseline: Option<&BehavioralBaseline>,
        thresholds: &DetectorThresholds,
        _cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        if window.events.len() < MIN_EVENTS {
            return vec![];
        }
        let mut times: Vec<_> = window.events.iter().map(|e| e.occurred_at).collect();
        times.sort();
        let intervals: Vec<f64> = times
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
            .collect();

        let (mean, std) = mean_std(&intervals);
        if mean <= 0.0 {
            return vec![];
        }
        let cv = std / mean;
        if cv > thresholds.timing_variance_max_cv {
            return vec![];
        }

        vec![PatternDraft {
            pattern_type: PatternType::TimingVariance,
            confidence: ((1.0 - cv / thresholds.timing_variance_max_cv.max(f64::EPSILON)) * 40.0
                + 55.0)
                .min(98.0),
            severity: Severity::High,
            evidence: serde_json::json!({
                "coefficientOfVariation": (cv * 10000.0).round() / 10000.0,
                "meanIntervalSecs": (mean * 100.0).round() / 100.0,
                "intervalCount": intervals.len(),
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use chrono::Utc;

    #[test]
    fn metronomic_schedule_is_flagged() {
        let automation = automation("cron bot", &[]);
        let now = Utc::now();
        let events: Vec<_> = (0..30)
            .map(|i| event_at(&automation, now - chrono::Duration::seconds(i * 60)))
            .collect();
        let window = window(&automation, &events);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts =
            TimingVarianceDetector.detect(&window, None, &DetectorThresholds::default(), &cfg);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].severity, Severity::High);
        assert_eq!(drafts[0].evidence["intervalCount"], 29);
    }

    #[test]
    fn human_jitter_passes() {
        let automation = automation("human-ish", &[]);
        let now = Utc::now();
        // Irregular gaps: 1m, 4m, 9m, 16m, ...
        let events: Vec<_> = (0..25i64)
            .map(|i| event_at(&automation, now - chrono::Duration::minutes(i * i)))
            .collect();
        let window = window(&automation, &events);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts =
            TimingVarianceDetector.detect(&window, None, &DetectorThresholds::default(), &cfg);
        assert!(drafts.is_empty());
    }

    #[test]
    fn short_windows_are_ignored() {
        let automation = automation("sparse bot", &[]);
        let now = Utc::now();
        let events: Vec<_> = (0..5)
            .map(|i| event_at(&automation, now - chrono::Duration::seconds(i * 60)))
            .collect();
        let window = window(&automation, &events);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        assert!(TimingVarianceDetector
            .detect(&window, None, &DetectorThresholds::default(), &cfg)
            .is_empty());
    }
}
