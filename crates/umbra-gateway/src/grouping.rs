//! Automation list shapes
//!
//! The list endpoint serves either a flat automation list or, with
//! `groupBy=vendor`, vendor groups. Grouping is display-time only: every
//! automation id survives inside its group, and the union of grouped
//! applications equals the flat list.

use serde::Serialize;
use std::collections::BTreeMap;
use umbra_core::types::{DiscoveredAutomation, Platform, RiskAssessment, Severity};
use uuid::Uuid;

/// Automation as the dashboard sees it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationView {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
    pub platform: Platform,
    pub automation_type: umbra_core::types::AutomationType,
    pub vendor_name: Option<String>,
    pub vendor_group: Option<String>,
    pub permissions: Vec<String>,
    pub scope_count: usize,
    pub owner: Option<String>,
    pub is_active: bool,
    pub risk_level: Option<Severity>,
    pub risk_score: Option<f64>,
    pub first_discovered_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
}

pub fn automation_view(
    automation: DiscoveredAutomation,
    risk: Option<&RiskAssessment>,
) -> AutomationView {
    AutomationView {
        id: automation.id,
        external_id: automation.external_id,
        name: automation.name,
        platform: automation.platform,
        automation_type: automation.automation_type,
        vendor_name: automation.vendor_name,
        vendor_group: automation.vendor_group,
        scope_count: automation.permissions.len(),
        permissions: automation.permissions,
        owner: automation.owner,
        is_active: automation.is_active,
        risk_level: risk.map(|r| r.risk_level),
        risk_score: risk.map(|r| r.risk_score),
        first_discovered_at: automation.first_discovered_at,
        last_seen_at: automation.last_seen_at,
    }
}

/// One vendor's applications on one platform
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorGroup {
    pub vendor_name: String,
    pub platform: Platform,
    pub application_count: usize,
    pub highest_risk_level: Severity,
    pub applications: Vec<AutomationView>,
}

/// Group views by `(vendor, platform)`. Automations without a vendor name
/// fall back to their own display name so nothing disappears from the
/// grouped response.
pub fn group_by_vendor(views: Vec<AutomationView>) -> Vec<VendorGroup> {
    let mut groups: BTreeMap<(String, String), VendorGroup> = BTreeMap::new();
    for view in views {
        let vendor = view
            .vendor_name
            .clone()
            .unwrap_or_else(|| view.name.clone());
        let key = (vendor.to_lowercase(), view.platform.as_str().to_string());
        let group = groups.entry(key).or_insert_with(|| VendorGroup {
            vendor_name: vendor,
            platform: view.platform,
            application_count: 0,
            highest_risk_level: Severity::Low,
            applications: Vec::new(),
        });
        group.application_count += 1;
        if let Some(level) = view.risk_level {
            if level > group.highest_risk_level {
                group.highest_risk_level = level;
            }
        }
        group.applications.push(view);
    }
    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use umbra_core::types::AutomationType;

    fn view(name: &str, vendor: Option<&str>, platform: Platform, scopes: usize, level: Option<Severity>) -> AutomationView {
        AutomationView {
            id: Uuid::new_v4(),
            external_id: format!("ext-{name}"),
            name: name.to_string(),
            platform,
            automation_type: AutomationType::OauthApp,
            vendor_name: vendor.map(str::to_string),
            vendor_group: vendor.map(|v| format!("{}-{}", v.to_lowercase(), platform.as_str())),
            permissions: (0..scopes).map(|i| format!("scope:{i}")).collect(),
            scope_count: scopes,
            owner: None,
            is_active: true,
            risk_level: level,
            risk_score: level.map(|_| 50.0),
            first_discovered_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn same_vendor_on_one_platform_forms_one_group() {
        let groups = group_by_vendor(vec![
            view("Attio", Some("Attio"), Platform::Google, 3, Some(Severity::Medium)),
            view("Attio CRM", Some("Attio"), Platform::Google, 8, Some(Severity::High)),
        ]);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.vendor_name, "Attio");
        assert_eq!(group.platform, Platform::Google);
        assert_eq!(group.application_count, 2);
        assert_eq!(group.highest_risk_level, Severity::High);
        let mut scope_counts: Vec<usize> =
            group.applications.iter().map(|a| a.scope_count).collect();
        scope_counts.sort();
        assert_eq!(scope_counts, vec![3, 8]);
    }

    #[test]
    fn same_vendor_on_two_platforms_stays_separate() {
        let groups = group_by_vendor(vec![
            view("Zapier", Some("Zapier"), Platform::Slack, 2, None),
            view("Zapier", Some("Zapier"), Platform::Google, 4, None),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn grouped_union_equals_the_flat_list() {
        let views = vec![
            view("Attio", Some("Attio"), Platform::Google, 3, None),
            view("Attio CRM", Some("Attio"), Platform::Google, 8, None),
            view("mystery-bot", None, Platform::Slack, 1, None),
        ];
        let flat_ids: Vec<Uuid> = views.iter().map(|v| v.id).collect();
        let groups = group_by_vendor(views);
        let mut grouped_ids: Vec<Uuid> = groups
            .iter()
            .flat_map(|g| g.applications.iter().map(|a| a.id))
            .collect();
        grouped_ids.sort();
        let mut expected = flat_ids;
        expected.sort();
        assert_eq!(grouped_ids, expected);
    }
}
