//! Batch-operation detector
//!
//! Flags K or more near-identical operations inside a short interval.
//! Similarity is measured on the operation type plus a target-class
//! signature with instance identifiers stripped.

use chrono::Duration;
use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{DetectionWindow, Detector, PatternDraft};

/// Interval the cluster must fit inside
const BATCH_WINDOW_SECS: i64 = 300;

/// Collapse a target like `channel:C0424` or `file_1234` into its class
pub fn target_class(target: Option<&str>) -> String {
    let Some(target) = target else {
        return "none".to_string();
    };
    let class = target.split([':', '/']).next().unwrap_or(target);
    class
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .collect::<String>()
        .trim_matches(['_', '-'])
        .to_string()
}

pub struct BatchOperationDetector;

impl Detector for BatchOperationDetector {
    fn name(&self) -> &'static str {
        "batch_operation"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::BatchOperation
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        _baseline: Option<&BehavioralBaseline>,
        thresholds: &DetectorThresholds,
        _cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        let min_size = thresholds.batch_min_size as usize;
        let mut by_signature: std::collections::HashMap<String, Vec<chrono::DateTime<chrono::Utc>>> =
            std::collections::HashMap::new();
        for event in window.events {
            let signature = format!("{}|{}", event.event_type, target_class(event.target.as_deref()));
            by_signature.entry(signature).or_default().push(event.occurred_at);
        }

        let mut drafts = Vec::new();
        for (signature, mut times) in by_signature {
            if times.len() < min_size {
                continue;
            }
            times.sort();
            // Largest cluster inside the batch window, two-pointer sweep
            let mut best = 0usize;
            let mut start = 0usize;
            for end in 0..times.len() {
                while times[end] - times[start] > Duration::seconds(BATCH_WINDOW_SECS) {
                    start += 1;
                }
                best = best.max(end - start + 1);
            }
            if best < min_size {
                continue;
            }

            let severity = if best >= min_size * 10 {
                Severity::Critical
            } else if best >= min_size * 3 {
                Severity::High
            } else {
                Severity::Medium
            };
            drafts.push(PatternDraft {
                pattern_type: PatternType::BatchOperation,
                confidence: (40.0 + best as f64 * 2.0).min(98.0),
                severity,
                evidence: serde_json::json!({
                    "operationSignature": signature,
                    "clusterSize": best,
                    "windowSeconds": BATCH_WINDOW_SECS,
                }),
            });
        }
        drafts.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        drafts
    }
}
