//! Off-hours detector
//!
//! Flags activity outside the organization's learned business window.
//! Stays silent until the baseline confidence clears the configured floor.

use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{DetectionWindow, Detector, PatternDraft};

/// Minimum off-hours events before a pattern is worth raising
const MIN_OFF_HOURS_EVENTS: usize = 3;

pub struct OffHoursDetector;

impl Detector for OffHoursDetector {
    fn name(&self) -> &'static str {
        "off_hours"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::OffHours
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        baseline: Option<&BehavioralBaseline>,
        _thresholds: &DetectorThresholds,
        cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        let Some(baseline) = baseline else {
            return vec![];
        };
        if baseline.confidence < cfg.off_hours_min_confidence {
            return vec![];
        }
        if window.events.is_empty() {
            return vec![];
        }

        let off_hours: Vec<_> = window
            .events
            .iter()
            .filter(|e| !baseline.business_window.contains(e.occurred_at))
            .collect();
        if off_hours.len() < MIN_OFF_HOURS_EVENTS {
            return vec![];
        }

        let fraction = off_hours.len() as f64 / window.events.len() as f64;
        let severity = if fraction >= 0.8 {
            Severity::High
        } else if fraction >= 0.5 {
            Severity::Medium
        } else {
            Severity::Low
        };

        vec![PatternDraft {
            pattern_type: PatternType::OffHours,
            confidence: (fraction * 100.0 * baseline.confidence).min(97.0),
            severity,
            evidence: serde_json::json!({
                "offHoursEvents": off_hours.len(),
                "totalEvents": window.events.len(),
                "offHoursFraction": (fraction * 100.0).round() / 100.0,
                "businessWindow": {
                    "startHour": baseline.business_window.start_hour,
                    "endHour": baseline.business_window.end_hour,
                },
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use chrono::TimeZone;

    fn night_events(automation: &DiscoveredAutomation, count: usize) -> Vec<ActivityEvent> {
        (0..count)
            .map(|i| {
                // 02:00 UTC on a Wednesday
                let at = chrono::Utc
                    .with_ymd_and_hms(2026, 7, 1, 2, i as u32 % 60, 0)
                    .unwrap();
                event_at(automation, at)
            })
            .collect()
    }

    #[test]
    fn night_activity_with_established_baseline_is_flagged() {
        let automation = automation("night bot", &[]);
        let events = night_events(&automation, 10);
        let window = window(&automation, &events);
        let baseline = baseline_with(10.0, 2.0, 0.9);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = OffHoursDetector.detect(&window, Some(&baseline), &DetectorThresholds::default(), &cfg);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].severity, Severity::High);
        assert_eq!(drafts[0].evidence["offHoursEvents"], 10);
    }

    #[test]
    fn low_confidence_baseline_keeps_detector_silent() {
        let automation = automation("night bot", &[]);
        let events = night_events(&automation, 10);
        let window = window(&automation, &events);
        let baseline = baseline_with(10.0, 2.0, 0.4);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = OffHoursDetector.detect(&window, Some(&baseline), &DetectorThresholds::default(), &cfg);
        assert!(drafts.is_empty());
        assert!(OffHoursDetector
            .detect(&window, None, &DetectorThresholds::default(), &cfg)
            .is_empty());
    }

    #[test]
    fn business_hours_activity_is_clean() {
        let automation = automation("day bot", &[]);
        let events: Vec<_> = (0..10)
            .map(|i| {
                let at = chrono::Utc
                    .with_ymd_and_hms(2026, 7, 1, 10, i as u32, 0)
                    .unwrap();
                event_at(&automation, at)
            })
            .collect();
        let window = window(&automation, &events);
        let baseline = baseline_with(10.0, 2.0, 0.9);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = OffHoursDetector.detect(&window, Some(&baseline), &DetectorThresholds::default(), &cfg);
        assert!(drafts.is_empty());
    }
}
