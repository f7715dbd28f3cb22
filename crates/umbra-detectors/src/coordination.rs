//! Cross-actor coordination detector
//!
//! Flags automations whose events line up on the same minute-of-hour slots
//! as other actors in the organization, which is how coordinated schedules
//! look from audit data. Output feeds the correlator.

use std::collections::{HashMap, HashSet};
use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{DetectionWindow, Detector, PatternDraft};

/// Aligned events required before a pattern is raised
const MIN_ALIGNED: usize = 3;
/// Distinct co-actors required
const MIN_CO_ACTORS: usize = 2;

pub struct CoordinationDetector;

impl Detector for CoordinationDetector {
    fn name(&self) -> &'static str {
        "cross_actor_coordination"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::CrossActorCoordination
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        _baseline: Option<&BehavioralBaseline>,
        _thresholds: &DetectorThresholds,
        _cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        use chrono::Timelike;
        if window.events.is_empty() {
            return vec![];
        }

        let my_actor = window
            .events
            .first()
            .map(|e| e.actor_id.clone())
            .unwrap_or_default();
        let my_slots: HashSet<u32> = window.events.iter().map(|e| e.occurred_at.minute()).collect();

        // Who else fires in the same minute slots
        let mut aligned_events = 0usize;
        let mut co_actors: HashMap<&str, usize> = HashMap::new();
        for event in window.org_events {
            if event.actor_id == my_actor {
                continue;
            }
            if my_slots.contains(&event.occurred_at.minute()) {
                aligned_events += 1;
                *co_actors.entry(event.actor_id.as_str()).or_default() += 1;
            }
        }

        if aligned_events < MIN_ALIGNED || co_actors.len() < MIN_CO_ACTORS {
            return vec![];
        }

        // Many slots in play weakens the signal; few shared slots sharpen it
        let slot_specificity = 1.0 - (my_slots.len() as f64 / 60.0).min(0.9);
        let confidence =
            (30.0 + aligned_events as f64 * 4.0 + co_actors.len() as f64 * 8.0) * slot_specificity;

        vec![PatternDraft {
            pattern_type: PatternType::CrossActorCoordination,
            confidence: confidence.min(92.0),
            severity: if co_actors.len() >= 4 {
                Severity::High
            } else {
                Severity::Medium
            },
            evidence: serde_json::json!({
                "alignedEvents": aligned_events,
                "coActorCount": co_actors.len(),
                "sharedMinuteSlots": my_slots.len(),
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
    fn synchronized_actors_are_flagged() {
        let automation = automation("sync-a", &[]);
        let base = Utc.with_ymd_and_hms(2026, 7, 1, 9, 15, 0).unwrap();
        // This automation fires at :15 every hour
        let events: Vec<_> = (0..4)
            .map(|h| event_at(&automation, base + chrono::Duration::hours(h)))
            .collect();
        // Two other actors fire on the same minute slot
        let mut org_events = events.clone();
        for actor in ["sync-b", "sync-c"] {
            for h in 0..4 {
                let mut e = event_at(&automation, base + chrono::Duration::hours(h));
                e.actor_id = actor.to_string();
                org_events.push(e);
            }
        }
        let window = DetectionWindow {
            automation: &automation,
            events: &events,
            org_events: &org_events,
            known_permissions: &[],
            now: base + chrono::Duration::hours(5),
        };
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = CoordinationDetector.detect(&window, None, &DetectorThresholds::default(), &cfg);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].evidence["coActorCount"], 2);
        assert_eq!(drafts[0].evidence["alignedEvents"], 8);
    }

    #[test]
    fn lone_actor_is_clean() {
        let automation = automation("solo", &[]);
        let base = Utc.with_ymd_and_hms(2026, 7, 1, 9, 15, 0).unwrap();
        let events: Vec<_> = (0..4)
            .map(|h| event_at(&automation, base + chrono::Duration::hours(h)))
            .collect();
        let window = DetectionWindow {
            automation: &automation,
            events: &events,
            org_events: &events,
            known_permissions: &[],
            now: base + chrono::Duration::hours(5),
        };
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        assert!(CoordinationDetector
            .detect(&window, None, &DetectorThresholds::default(), &cfg)
            .is_empty());
    }
}
