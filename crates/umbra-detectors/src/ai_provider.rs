//! AI-provider detector
//!
//! Multi-method matcher: URL domains, scope names, display text, user
//! agents, model names, and outbound host patterns all vote, and evidence
//! accumulates across methods. Confidence combines match count with method
//! weights.

use serde_json::Value;
use umbra_core::config::DetectorConfig;
use umbra_core::types::*;

use crate::{DetectionWindow, Detector, PatternDraft};

/// One provider's match tables
struct ProviderSignature {
    name: &'static str,
    domains: &'static [&'static str],
    models: &'static [&'static str],
    keywords: &'static [&'static str],
}

/// The eight providers tracked by the platform
const PROVIDERS: &[ProviderSignature] = &[
    ProviderSignature {
        name: "openai",
        domains: &["api.openai.com", "oaiusercontent.com"],
        models: &["gpt-3", "gpt-4", "gpt-4o", "o1", "o3", "davinci"],
        keywords: &["openai", "chatgpt"],
    },
    ProviderSignature {
        name: "anthropic",
        domains: &["api.anthropic.com", "claude.ai"],
        models: &["claude-3", "claude-4", "claude-sonnet", "claude-opus", "claude-haiku"],
        keywords: &["anthropic", "claude"],
    },
    ProviderSignature {
        name: "google-ai",
        domains: &["generativelanguage.googleapis.com", "aiplatform.googleapis.com"],
        models: &["gemini-1", "gemini-2", "gemini-pro", "palm-2"],
        keywords: &["gemini", "vertex ai"],
    },
    ProviderSignature {
        name: "cohere",
        domains: &["api.cohere.ai", "api.cohere.com"],
        models: &["command-r", "command-light", "embed-english"],
        keywords: &["cohere"],
    },
    ProviderSignature {
        name: "mistral",
        domains: &["api.mistral.ai"],
        models: &["mistral-large", "mistral-small", "mixtral"],
        keywords: &["mistral"],
    },
    ProviderSignature {
        name: "meta-llama",
        domains: &["llama.meta.com", "api.llama-api.com"],
        models: &["llama-2", "llama-3", "llama-4", "codellama"],
        keywords: &["llama"],
    },
    ProviderSignature {
        name: "perplexity",
        domains: &["api.perplexity.ai"],
        models: &["sonar", "pplx-"],
        keywords: &["perplexity"],
    },
    ProviderSignature {
        name: "stability",
        domains: &["api.stability.ai"],
        models: &["stable-diffusion", "sdxl", "stable-image"],
        keywords: &["stability ai", "stablediffusion"],
    },
];

/// Method weights; domains and models are the strongest signals
const WEIGHT_DOMAIN: f64 = 30.0;
const WEIGHT_MODEL: f64 = 25.0;
const WEIGHT_DISPLAY: f64 = 15.0;
const WEIGHT_SCOPE: f64 = 10.0;
const WEIGHT_USER_AGENT: f64 = 10.0;
const WEIGHT_OUTBOUND_HOST: f64 = 20.0;

/// Walk a JSON payload and collect every string it contains
fn collect_strings(value: &Value, into: &mut Vec<String>) {
    match value {
        Value::String(s) => into.push(s.to_lowercase()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, into)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, into)),
        _ => {}
    }
}

pub struct AiProviderDetector;

impl Detector for AiProviderDetector {
    fn name(&self) -> &'static str {
        "ai_provider"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::AiProvider
    }

    fn detect(
        &self,
        window: &DetectionWindow<'_>,
        _baseline: Option<&BehavioralBaseline>,
        _thresholds: &DetectorThresholds,
        _cfg: &DetectorConfig,
    ) -> Vec<PatternDraft> {
        let automation = window.automation;
        let display = automation.name.to_lowercase();
        let scopes: Vec<String> = automation.permissions.iter().map(|s| s.to_lowercase()).collect();
        let mut metadata_strings = Vec::new();
        collect_strings(&automation.platform_metadata, &mut metadata_strings);
        let user_agent = automation
            .platform_metadata
            .get("user_agent")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .unwrap_or_default();
        let outbound_hosts: Vec<String> = window
            .events
            .iter()
            .filter_map(|e| e.target.as_deref())
            .map(str::to_lowercase)
            .collect();

        let mut drafts = Vec::new();
        for provider in PROVIDERS {
            let mut methods: Vec<&'static str> = Vec::new();
            let mut weight = 0.0;

            if provider
                .domains
                .iter()
                .any(|d| metadata_strings.iter().any(|s| s.contains(d)))
            {
                methods.push("url_domain");
                weight += WEIGHT_DOMAIN;
            }
            if provider
                .models
                .iter()
                .any(|m| metadata_strings.iter().any(|s| s.contains(m)))
            {
                methods.push("model_name");
                weight += WEIGHT_MODEL;
            }
            if provider.keywords.iter().any(|k| display.contains(k)) {
                methods.push("display_text");
                weight += WEIGHT_DISPLAY;
            }
            if provider
                .keywords
                .iter()
                .any(|k| scopes.iter().any(|s| s.contains(k)))
            {
                methods.push("scope_name");
                weight += WEIGHT_SCOPE;
            }
            if !user_agent.is_empty() && provider.keywords.iter().any(|k| user_agent.contains(k)) {
                methods.push("user_agent");
                weight += WEIGHT_USER_AGENT;
            }
            if provider
                .domains
                .iter()
                .any(|d| outbound_hosts.iter().any(|h| h.contains(d)))
            {
                methods.push("outbound_host");
                weight += WEIGHT_OUTBOUND_HOST;
            }

            if methods.is_empty() {
                continue;
            }

            // A generative-AI automation on a collaboration platform is the
            // shadow-AI case this platform exists for
            let on_ai_platform = matches!(
                automation.platform,
                Platform::Chatgpt | Platform::Claude | Platform::Gemini
            );
            let severity = if on_ai_platform {
                Severity::Low
            } else if methods.len() >= 3 {
                Severity::High
            } else {
                Severity::Medium
            };

            drafts.push(PatternDraft {
                pattern_type: PatternType::AiProvider,
                confidence: (weight + methods.len() as f64 * 5.0).min(96.0),
                severity,
                evidence: serde_json::json!({
                    "provider": provider.name,
                    "methods": methods,
                    "methodCount": methods.len(),
                }),
            });
        }
        drafts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use chrono::Utc;

    #[test]
    fn multi_method_match_accumulates_evidence() {
        let mut automation = automation("OpenAI Importer", &["chat:write"]);
        automation.platform_metadata = serde_json::json!({
            "endpoint": "https://api.openai.com/v1/chat/completions",
            "model": "gpt-4o",
            "user_agent": "openai-python/1.3"
        });
        let now = Utc::now();
        let events = vec![{
            let mut e = event_at(&automation, now);
            e.target = Some("api.openai.com".to_string());
            e
        }];
        let window = DetectionWindow {
            automation: &automation,
            events: &events,
            org_events: &events,
            known_permissions: &[],
            now,
        };
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = AiProviderDetector.detect(&window, None, &DetectorThresholds::default(), &cfg);
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.evidence["provider"], "openai");
        assert!(draft.evidence["methodCount"].as_u64().unwrap() >= 4);
        assert_eq!(draft.severity, Severity::High);
        assert!(draft.confidence > 80.0);
    }

    #[test]
    fn display_only_match_is_medium_and_lower_confidence() {
        let automation = automation("Claude summarizer", &[]);
        let window = window(&automation, &[]);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = AiProviderDetector.detect(&window, None, &DetectorThresholds::default(), &cfg);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].evidence["provider"], "anthropic");
        assert_eq!(drafts[0].severity, Severity::Medium);
        assert!(drafts[0].confidence < 50.0);
    }

    #[test]
    fn non_ai_automation_is_clean() {
        let automation = automation("Payroll sync", &["payroll:read"]);
        let window = window(&automation, &[]);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        assert!(AiProviderDetector
            .detect(&window, None, &DetectorThresholds::default(), &cfg)
            .is_empty());
    }

    #[test]
    fn native_ai_platform_use_is_low_severity() {
        let mut automation = automation("research assistant", &[]);
        automation.platform = Platform::Chatgpt;
        automation.platform_metadata = serde_json::json!({"model": "gpt-4o"});
        let window = window(&automation, &[]);
        let cfg = umbra_core::UmbraConfig::from_env().unwrap().detector;

        let drafts = AiProviderDetector.detect(&window, None, &DetectorThresholds::default(), &cfg);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].severity, Severity::Low);
    }
}
