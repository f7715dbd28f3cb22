//! Data-volume detector
//!
//! Flags a trailing day whose bytes-read or records-touched exceed the
//! automation's own historical daily average by the configured factor.

use chrono::Duration;
use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{DetectionWindow, Detector, PatternDraft};

pub struct DataVolumeDetector;

impl Detector for DataVolumeDetector {
    fn name(&self) -> &'static str {
        "data_volume"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::DataVolume
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        _baseline: Option<&BehavioralBaseline>,
        thresholds: &DetectorThresholds,
        _cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        let cutoff = window.now - Duration::hours(24);
        let (mut recent_bytes, mut recent_records) = (0u64, 0u64);
        let (mut old_bytes, mut old_records) = (0u64, 0u64);
        let mut oldest = window.now;

        for event in window.events {
            if event.occurred_at < oldest {
                oldest = event.occurred_at;
            }
            if event.occurred_at >= cutoff {
                recent_bytes += event.bytes.unwrap_or(0);
                recent_records += event.records.unwrap_or(0);
            } else {
                old_bytes += event.bytes.unwrap_or(0);
                old_records += event.records.unwrap_or(0);
            }
        }

        // Need at least one full prior day of history to compare against
        let history_days = ((cutoff - oldest).num_hours() as f64 / 24.0).floor();
        if history_days < 1.0 {
            return vec![];
        }
        let daily_bytes = old_bytes as f64 / history_days;
        let daily_records = old_records as f64 / history_days;

        let byte_factor = if daily_bytes > 0.0 {
            recent_bytes as f64 / daily_bytes
        } else {
            0.0
        };
        let record_factor = if daily_records > 0.0 {
            recent_records as f64 / daily_records
        } else {
            0.0
        };
        let factor = byte_factor.max(record_factor);
        if factor < thresholds.data_volume_factor {
            return vec![];
        }

        let severity = if factor >= thresholds.data_volume_factor * 5.0 {
            Severity::Critical
        } else if factor >= thresholds.data_volume_factor * 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };

        vec![PatternDraft {
            pattern_type: PatternType::DataVolume,
            confidence: (45.0 + factor * 5.0).min(97.0),
            severity,
            evidence: serde_json::json!({
                "recentBytes": recent_bytes,
                "recentRecords": recent_records,
                "historicalDailyBytes": daily_bytes.round(),
                "historicalDailyRecords": daily_records.round(),
                "exceedanceFactor": (factor * 10.0).round() / 10.0,
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use chrono::Utc;

    fn volume_event(
        automation: &DiscoveredAutomation,
        hours_ago: i64,
        bytes: u64,
    ) -> ActivityEvent {
        let mut e = event_at(automation, Utc::now() - chrono::Duration::hours(hours_ago));
        e.bytes = Some(bytes);
        e
    }

    #[test]
    fn exfiltration_size_spike_is_flagged() {
        let automation = automation("drive sync", &[]);
        let mut events = Vec::new();
        // Seven days of ~1 MB/day history
        for day in 1..=7 {
            events.push(volume_event(&automation, 24 * day + 1, 1_000_000));
        }
        // Then 50 MB in the last day
        events.push(volume_event(&automation, 2, 50_000_000));
        let window = window(&automation, &events);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = DataVolumeDetector.detect(&window, None, &DetectorThresholds::default(), &cfg);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].severity, Severity::Critical);
        assert!(drafts[0].evidence["exceedanceFactor"].as_f64().unwrap() > 40.0);
    }

    #[test]
    fn steady_volume_is_clean() {
        let automation = automation("drive sync", &[]);
        let mut events = Vec::new();
        for day in 0..7 {
            events.push(volume_event(&automation, 24 * day + 1, 1_000_000));
        }
        let window = window(&automation, &events);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        assert!(DataVolumeDetector
            .detect(&window, None, &DetectorThresholds::default(), &cfg)
            .is_empty());
    }

    #[test]
    fn no_history_means_no_verdict() {
        let automation = automation("brand new", &[]);
        let events = vec![volume_event(&automation, 1, 99_000_000)];
        let window = window(&automation, &events);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        assert!(DataVolumeDetector
            .detect(&window, None, &DetectorThresholds::default(), &cfg)
            .is_empty());
    }
}
