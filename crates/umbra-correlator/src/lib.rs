//! Umbra cross-platform correlator
//!
//! After a run finishes, recently-active automations within one organization
//! are grouped by five correlation signals. Chains are value objects built
//! from automation ids; the correlator never owns automations. Chains
//! spanning two or more platforms carry the cross-platform flag.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use umbra_core::types::*;
use uuid::Uuid;

/// Signal strength below which a pairwise link is ignored
const LINK_FLOOR: f64 = 0.5;
/// Shared minute slots needed before timing similarity means anything
const MIN_TIMING_SLOTS: usize = 3;

/// What the engine knows about one automation going into correlation
#[derive(Debug, Clone)]
pub struct AutomationProfile {
    pub automation: DiscoveredAutomation,
    /// AI provider tag from the ai-provider detector, when matched
    pub ai_provider: Option<String>,
    /// Minute-of-hour slots this automation fires on
    pub event_minutes: Vec<u32>,
    /// Targets its events touched
    pub targets: Vec<String>,
}

/// One pairwise link between two automations
#[derive(Debug, Clone)]
struct Link {
    a: usize,
    b: usize,
    signal: CorrelationSignal,
}

fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Lowercased word tokens of a display name, noise words dropped
fn name_tokens(name: &str) -> HashSet<String> {
    const NOISE: &[&str] = &["the", "for", "app", "bot", "api", "integration"];
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3 && !NOISE.contains(t))
        .map(str::to_string)
        .collect()
}

/// All pairwise signals between two profiles
fn pair_signals(a: &AutomationProfile, b: &AutomationProfile) -> Vec<CorrelationSignal> {
    let mut signals = Vec::new();

    if let (Some(pa), Some(pb)) = (&a.ai_provider, &b.ai_provider) {
        if pa == pb {
            signals.push(CorrelationSignal {
                correlation_type: CorrelationType::SameAiProvider,
                strength: 0.9,
            });
        }
    }

    let slots_a: HashSet<u32> = a.event_minutes.iter().copied().collect();
    let slots_b: HashSet<u32> = b.event_minutes.iter().copied().collect();
    if slots_a.len() >= MIN_TIMING_SLOTS || slots_b.len() >= MIN_TIMING_SLOTS {
        let similarity = jaccard(&slots_a, &slots_b);
        if similarity >= LINK_FLOOR {
            signals.push(CorrelationSignal {
                correlation_type: CorrelationType::SimilarTiming,
                strength: similarity,
            });
        }
    }

    // A touches what B touches, from another platform: a data path
    let targets_a: HashSet<&String> = a.targets.iter().collect();
    let targets_b: HashSet<&String> = b.targets.iter().collect();
    let shared_targets = targets_a.intersection(&targets_b).count();
    let direct_reference = b.targets.iter().any(|t| t.contains(&a.automation.external_id))
        || a.targets.iter().any(|t| t.contains(&b.automation.external_id));
    if direct_reference || (shared_targets > 0 && a.automation.platform != b.automation.platform) {
        signals.push(CorrelationSignal {
            correlation_type: CorrelationType::DataFlowChain,
            strength: if direct_reference { 0.85 } else { 0.7 },
        });
    }

    if let (Some(owner_a), Some(owner_b)) = (&a.automation.owner, &b.automation.owner) {
        if owner_a == owner_b {
            signals.push(CorrelationSignal {
                correlation_type: CorrelationType::SharedCredentials,
                strength: 0.8,
            });
        }
    }

    let overlap = jaccard(&name_tokens(&a.automation.name), &name_tokens(&b.automation.name));
    if overlap >= LINK_FLOOR {
        signals.push(CorrelationSignal {
            correlation_type: CorrelationType::SimilarNaming,
            strength: overlap,
        });
    }

    signals
}

/// Plain disjoint-set over profile indices
struct Dsu {
    parent: Vec<usize>,
}

impl Dsu {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Group profiles into correlation chains
pub fn correlate(
    organization_id: Uuid,
    profiles: &[AutomationProfile],
    now: DateTime<Utc>,
) -> Vec<CorrelationChain> {
    let mut links: Vec<Link> = Vec::new();
    for a in 0..profiles.len() {
        for b in (a + 1)..profiles.len() {
            for signal in pair_signals(&profiles[a], &profiles[b]) {
                if signal.strength >= LINK_FLOOR {
                    links.push(Link { a, b, signal });
                }
            }
        }
    }

    let mut dsu = Dsu::new(profiles.len());
    for link in &links {
        dsu.union(link.a, link.b);
    }

    // Collect components and the links inside each
    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..profiles.len() {
        members.entry(dsu.find(i)).or_default().push(i);
    }

    let mut chains = Vec::new();
    for (root, ids) in members {
        if ids.len() < 2 {
            continue;
        }
        let component_links: Vec<&Link> = links
            .iter()
            .filter(|l| dsu.find(l.a) == root)
            .collect();
        if component_links.is_empty() {
            continue;
        }

        // Keep the strongest signal per correlation type as support
        let mut best_by_type: HashMap<CorrelationType, f64> = HashMap::new();
        for link in &component_links {
            let entry = best_by_type
                .entry(link.signal.correlation_type)
                .or_insert(0.0);
            *entry = entry.max(link.signal.strength);
        }
        let mut supporting: Vec<CorrelationSignal> = best_by_type
            .iter()
            .map(|(t, s)| CorrelationSignal {
                correlation_type: *t,
                strength: *s,
            })
            .collect();
        supporting.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mean_strength =
            supporting.iter().map(|s| s.strength).sum::<f64>() / supporting.len() as f64;
        let confidence =
            (mean_strength + 0.1 * (supporting.len() as f64 - 1.0)).clamp(0.0, 0.98);
        let primary = supporting[0].correlation_type;

        let platforms: HashSet<Platform> = ids
            .iter()
            .map(|&i| profiles[i].automation.platform)
            .collect();
        let names: Vec<&str> = ids
            .iter()
            .map(|&i| profiles[i].automation.name.as_str())
            .take(4)
            .collect();

        chains.push(CorrelationChain {
            id: Uuid::new_v4(),
            organization_id,
            automation_ids: ids.iter().map(|&i| profiles[i].automation.id).collect(),
            correlation_type: primary,
            supporting,
            confidence,
            cross_platform_chain: platforms.len() >= 2,
            description: format!(
                "{} automations linked across {} platform(s): {}",
                ids.len(),
                platforms.len(),
                names.join(", ")
            ),
            created_at: now,
        });
    }

    chains.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    chains
}

/// Build a profile from an automation and its window events
pub fn profile_from(
    automation: DiscoveredAutomation,
    events: &[ActivityEvent],
    ai_provider: Option<String>,
) -> AutomationProfile {
    use chrono::Timelike;
    let mine: Vec<&ActivityEvent> = events
        .iter()
        .filter(|e| e.automation_external_id.as_deref() == Some(automation.external_id.as_str()))
        .collect();
    AutomationProfile {
        ai_provider,
        event_minutes: mine.iter().map(|e| e.occurred_at.minute()).collect(),
        targets: mine
            .iter()
            .filter_map(|e| e.target.clone())
            .collect(),
        automation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automation(name: &str, platform: Platform, owner: Option<&str>) -> DiscoveredAutomation {
        DiscoveredAutomation {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            discovery_run_id: Uuid::new_v4(),
            external_id: format!("ext-{name}"),
            automation_type: AutomationType::Bot,
            name: name.to_string(),
            platform,
            platform_metadata: serde_json::json!({}),
            permissions: vec![],
            owner: owner.map(str::to_string),
            vendor_name: None,
            vendor_group: None,
            vendor_override: false,
            is_active: true,
            first_discovered_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    fn profile(
        name: &str,
        platform: Platform,
        provider: Option<&str>,
        minutes: Vec<u32>,
    ) -> AutomationProfile {
        AutomationProfile {
            automation: automation(name, platform, None),
            ai_provider: provider.map(str::to_string),
            event_minutes: minutes,
            targets: vec![],
        }
    }

    #[test]
    fn same_provider_across_platforms_forms_cross_platform_chain() {
        let org = Uuid::new_v4();
        let profiles = vec![
            profile("slack gpt bot", Platform::Slack, Some("openai"), vec![]),
            profile("drive gpt sync", Platform::Google, Some("openai"), vec![]),
            profile("unrelated", Platform::Microsoft, None, vec![]),
        ];
        let chains = correlate(org, &profiles, Utc::now());
        assert_eq!(chains.len(), 1);
        let chain = &chains[0];
        assert_eq!(chain.automation_ids.len(), 2);
        assert!(chain.cross_platform_chain);
        assert!(chain
            .supporting
            .iter()
            .any(|s| s.correlation_type == CorrelationType::SameAiProvider));
    }

    #[test]
    fn aligned_schedules_link_by_timing() {
        let org = Uuid::new_v4();
        let profiles = vec![
            profile("cron a", Platform::Slack, None, vec![0, 15, 30, 45]),
            profile("cron b", Platform::Slack, None, vec![0, 15, 30, 45]),
            profile("random", Platform::Slack, None, vec![7, 23, 41]),
        ];
        let chains = correlate(org, &profiles, Utc::now());
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].correlation_type, CorrelationType::SimilarTiming);
        assert!(!chains[0].cross_platform_chain);
    }

    #[test]
    fn shared_owner_and_naming_raise_confidence() {
        let org = Uuid::new_v4();
        let a = AutomationProfile {
            automation: automation("Attio Importer", Platform::Slack, Some("jane@acme.com")),
            ai_provider: None,
            event_minutes: vec![],
            targets: vec![],
        };
        let b = AutomationProfile {
            automation: automation("Attio Importer Sync", Platform::Google, Some("jane@acme.com")),
            ai_provider: None,
            event_minutes: vec![],
            targets: vec![],
        };
        let chains = correlate(org, &[a, b], Utc::now());
        assert_eq!(chains.len(), 1);
        assert!(chains[0].supporting.len() >= 2);
        assert!(chains[0].confidence > 0.8);
    }

    #[test]
    fn unrelated_automations_produce_no_chains() {
        let org = Uuid::new_v4();
        let profiles = vec![
            profile("alpha", Platform::Slack, None, vec![3]),
            profile("omega", Platform::Google, Some("openai"), vec![48]),
        ];
        assert!(correlate(org, &profiles, Utc::now()).is_empty());
    }

    #[test]
    fn data_flow_links_shared_targets_across_platforms() {
        let org = Uuid::new_v4();
        let mut a = profile("exporter", Platform::Google, None, vec![]);
        a.targets = vec!["crm-export-bucket".to_string()];
        let mut b = profile("uploader", Platform::Slack, None, vec![]);
        b.targets = vec!["crm-export-bucket".to_string()];
        let chains = correlate(org, &[a, b], Utc::now());
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].correlation_type, CorrelationType::DataFlowChain);
        assert!(chains[0].cross_platform_chain);
    }
}
