//! Permission-escalation detector
//!
//! Compares the automation's current scope set against the set recorded
//! before this run; monotonic growth is the signal.

use std::collections::HashSet;
use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{DetectionWindow, Detector, PatternDraft};

/// Scope substrings that make an escalation worse
const SENSITIVE_MARKERS: &[&str] = &["admin", "write", "delete", "manage", "full_access", "all"];

pub fn is_sensitive(scope: &str) -> bool {
    let lower = scope.to_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lower.contains(m))
}

pub struct PermissionEscalationDetector;

impl Detector for PermissionEscalationDetector {
    fn name(&self) -> &'static str {
        "permission_escalation"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::PermissionEscalation
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        _baseline: Option<&BehavioralBaseline>,
        _thresholds: &DetectorThresholds,
        _cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        // First sighting has no history to escalate from
        if window.known_permissions.is_empty() {
            return vec![];
        }
        let known: HashSet<&str> = window.known_permissions.iter().map(String::as_str).collect();
        let added: Vec<&str> = window
            .automation
            .permissions
            .iter()
            .map(String::as_str)
            .filter(|scope| !known.contains(scope))
            .collect();
        if added.is_empty() {
            return vec![];
        }

        let sensitive_added = added.iter().filter(|s| is_sensitive(s)).count();
        let severity = if sensitive_added >= 2 {
            Severity::Critical
        } else if sensitive_added == 1 {
            Severity::High
        } else {
            Severity::Medium
        };

        vec![PatternDraft {
            pattern_type: PatternType::PermissionEscalation,
            confidence: (60.0 + added.len() as f64 * 8.0 + sensitive_added as f64 * 10.0).min(98.0),
            severity,
            evidence: serde_json::json!({
                "addedScopes": added,
                "sensitiveAdded": sensitive_added,
                "previousScopeCount": window.known_permissions.len(),
                "currentScopeCount": window.automation.permissions.len(),
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
    fn added_sensitive_scope_escalates_severity() {
        let automation = automation("greedy app", &["channels:read", "files:read", "admin.users:write"]);
        let known = vec!["channels:read".to_string(), "files:read".to_string()];
        let window = DetectionWindow {
            automation: &automation,
            events: &[],
            org_events: &[],
            known_permissions: &known,
            now: Utc::now(),
        };
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = PermissionEscalationDetector.detect(
            &window,
            None,
            &DetectorThresholds::default(),
            &cfg,
        );
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].severity, Severity::High);
        assert_eq!(drafts[0].evidence["addedScopes"][0], "admin.users:write");
    }

    #[test]
    fn unchanged_scopes_are_clean() {
        let automation = automation("stable app", &["channels:read"]);
        let known = vec!["channels:read".to_string()];
        let window = DetectionWindow {
            automation: &automation,
            events: &[],
            org_events: &[],
            known_permissions: &known,
            now: Utc::now(),
        };
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        assert!(PermissionEscalationDetector
            .detect(&window, None, &DetectorThresholds::default(), &cfg)
            .is_empty());
    }

    #[test]
    fn first_sighting_never_escalates() {
        let automation = automation("new app", &["admin.everything"]);
        let window = DetectionWindow {
            automation: &automation,
            events: &[],
            org_events: &[],
            known_permissions: &[],
            now: Utc::now(),
        };
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        assert!(PermissionEscalationDetector
            .detect(&window, None, &DetectorThresholds::default(), &cfg)
            .is_empty());
    }
}
