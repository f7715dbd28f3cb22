//! Qualitative validator
//!
//! Forwards a compact automation descriptor to an external language-model
//! endpoint for a structured verdict. Cost-metered per run, cached by
//! descriptor hash, bounded by a request deadline, and entirely optional:
//! when disabled or failing, the other detectors are unaffected.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use umbra_core::config::ValidatorConfig;
use umbra_core::types::*;

use crate::PatternDraft;

/// Flat cost assumed per validation call, in USD
const COST_PER_CALL_USD: f64 = 0.002;

/// Compact descriptor sent to the endpoint; no tokens, no tenant ids
#[derive(Debug, Clone, Serialize)]
pub struct AutomationDescriptor {
    pub name: String,
    pub automation_type: AutomationType,
    pub platform: Platform,
    pub permissions: Vec<String>,
    pub vendor_name: Option<String>,
}

impl AutomationDescriptor {
    pub fn from_automation(automation: &DiscoveredAutomation) -> Self {
        Self {
            name: automation.name.clone(),
            automation_type: automation.automation_type,
            platform: automation.platform,
            permissions: automation.permissions.clone(),
            vendor_name: automation.vendor_name.clone(),
        }
    }

    /// Cache key over the descriptor contents
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self).unwrap_or_default());
        hex::encode(hasher.finalize())
    }
}

/// Structured verdict returned by the endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub classification: VerdictClass,
    /// Confidence in [0,1]
    pub confidence: f64,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerdictClass {
    Benign,
    Suspicious,
    Malicious,
}

/// Per-run cost meter; calls stop once the budget is exhausted
pub struct CostMeter {
    budget_usd: f64,
    spent_millicents: AtomicU64,
}

impl CostMeter {
    pub fn new(budget_usd: f64) -> Self {
        Self {
            budget_usd,
            spent_millicents: AtomicU64::new(0),
        }
    }

    /// Reserve one call's cost; false when the budget is gone
    pub fn try_charge(&self) -> bool {
        let increment = (COST_PER_CALL_USD * 100_000.0) as u64;
        let budget = (self.budget_usd * 100_000.0) as u64;
        let prior = self.spent_millicents.fetch_add(increment, Ordering::SeqCst);
        prior + increment <= budget
    }

    pub fn spent_usd(&self) -> f64 {
        self.spent_millicents.load(Ordering::SeqCst) as f64 / 100_000.0
    }
}

pub struct QualitativeValidator {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    cache: DashMap<String, Verdict>,
}

impl QualitativeValidator {
    /// Build from configuration; `None` when disabled or unconfigured
    pub fn from_config(cfg: &ValidatorConfig) -> Option<Self> {
        if !cfg.enabled {
            return None;
        }
        let endpoint = cfg.endpoint.clone()?;
        Some(Self {
            http: reqwest::Client::new(),
            endpoint,
            timeout: Duration::from_secs(cfg.request_timeout_sec),
            cache: DashMap::new(),
        })
    }

    /// Validate one automation. Returns `Ok(None)` when skipped (budget,
    /// benign verdict); errors are for the caller to downgrade to warnings.
    pub async fn validate(
        &self,
        automation: &DiscoveredAutomation,
        meter: &CostMeter,
    ) -> Result<Option<PatternDraft>, String> {
        let descriptor = AutomationDescriptor::from_automation(automation);
        let key = descriptor.hash();

        let verdict = if let Some(cached) = self.cache.get(&key) {
            cached.clone()
        } else {
            if !meter.try_charge() {
                tracing::debug!(spent = meter.spent_usd(), "validator budget exhausted for run");
                return Ok(None);
            }
            let response = self
                .http
                .post(&self.endpoint)
                .timeout(self.timeout)
                .json(&descriptor)
                .send()
                .await
                .map_err(|e| format!("validator endpoint unreachable: {e}"))?;
            if !response.status().is_success() {
                return Err(format!("validator returned {}", response.status()));
            }
            let verdict: Verdict = response
                .json()
                .await
                .map_err(|e| format!("validator returned malformed verdict: {e}"))?;
            self.cache.insert(key, verdict.clone());
            verdict
        };

        Ok(verdict_to_draft(&verdict))
    }
}

/// Map a verdict onto a pattern draft; benign verdicts produce nothing
pub fn verdict_to_draft(verdict: &Verdict) -> Option<PatternDraft> {
    let severity = match verdict.classification {
        VerdictClass::Benign => return None,
        VerdictClass::Suspicious => Severity::Medium,
        VerdictClass::Malicious => Severity::High,
    };
    Some(PatternDraft {
        pattern_type: PatternType::QualitativeValidation,
        confidence: (verdict.confidence * 100.0).clamp(0.0, 99.0),
        severity,
        evidence: serde_json::json!({
            "classification": verdict.classification,
            "rationale": verdict.rationale,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::automation;

    #[test]
    fn disabled_config_builds_nothing() {
        let cfg = ValidatorConfig {
            enabled: false,
            endpoint: Some("http://validator.local".to_string()),
            max_cost_usd_per_run: 1.0,
            max_concurrency: 2,
            request_timeout_sec: 5,
        };
        assert!(QualitativeValidator::from_config(&cfg).is_none());

        let cfg = ValidatorConfig {
            enabled: true,
            endpoint: None,
            max_cost_usd_per_run: 1.0,
            max_concurrency: 2,
            request_timeout_sec: 5,
        };
        assert!(QualitativeValidator::from_config(&cfg).is_none());
    }

    #[test]
    fn descriptor_hash_is_stable_and_content_sensitive() {
        let a = automation("Attio CRM", &["contacts:read"]);
        let d1 = AutomationDescriptor::from_automation(&a);
        let d2 = AutomationDescriptor::from_automation(&a);
        assert_eq!(d1.hash(), d2.hash());

        let b = automation("Attio CRM", &["contacts:read", "contacts:write"]);
        assert_ne!(d1.hash(), AutomationDescriptor::from_automation(&b).hash());
    }

    #[test]
    fn cost_meter_cuts_off_at_budget() {
        let meter = CostMeter::new(0.01);
        let allowed = (0..20).filter(|_| meter.try_charge()).count();
        assert_eq!(allowed, 5); // 0.01 / 0.002
        assert!(!meter.try_charge());
    }

    #[test]
    fn verdicts_map_to_patterns() {
        assert!(verdict_to_draft(&Verdict {
            classification: VerdictClass::Benign,
            confidence: 0.9,
            rationale: None,
        })
        .is_none());

        let draft = verdict_to_draft(&Verdict {
            classification: VerdictClass::Malicious,
            confidence: 0.8,
            rationale: Some("credential harvesting shape".to_string()),
        })
        .unwrap();
        assert_eq!(draft.pattern_type, PatternType::QualitativeValidation);
        assert_eq!(draft.severity, Severity::High);
        assert_eq!(draft.confidence, 80.0);
    }
}
