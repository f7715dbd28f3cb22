//! Umbra analytics service
//!
//! Read-only aggregations over persisted state, always scoped by
//! organization. Every series is zero-filled to its declared length so the
//! dashboard never sees ragged arrays; soft-expired automations are
//! excluded unless explicitly requested.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use umbra_core::types::*;
use umbra_core::Result;
use umbra_store::{AutomationFilter, Store};
use uuid::Uuid;

/// Trend window; point counts include today
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Week,
    Month,
    Quarter,
}

impl Period {
    pub fn points(&self) -> usize {
        match self {
            Period::Week => 8,
            Period::Month => 31,
            Period::Quarter => 91,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "week" => Some(Period::Week),
            "month" => Some(Period::Month),
            "quarter" => Some(Period::Quarter),
            _ => None,
        }
    }
}

/// Daily severity series plus the daily average risk score
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskTrends {
    pub labels: Vec<String>,
    pub critical: Vec<u64>,
    pub high: Vec<u64>,
    pub medium: Vec<u64>,
    pub low: Vec<u64>,
    pub average_risk_score: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSlice {
    pub platform: Platform,
    pub count: u64,
    pub percentage: f64,
    pub high_risk_count: u64,
    pub color: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationGrowth {
    pub labels: Vec<String>,
    pub new_automations: Vec<u64>,
    pub cumulative: Vec<u64>,
    /// Percentage growth over the window
    pub growth_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopRisk {
    pub automation_id: Uuid,
    pub name: String,
    pub platform: Platform,
    pub vendor_name: Option<String>,
    pub risk_level: Severity,
    pub risk_score: f64,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub total_automations: u64,
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub platforms: u64,
    pub affected_users: u64,
    pub new_this_period: u64,
    /// Delta of new automations vs the previous period of equal length
    pub new_delta: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatMapRow {
    pub platform: Platform,
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeSlice {
    pub automation_type: AutomationType,
    pub count: u64,
    pub percentage: f64,
    pub average_risk_score: f64,
}

/// Analytics over the repository contracts
#[derive(Clone)]
pub struct AnalyticsService {
    store: Store,
}

fn day_labels(today: NaiveDate, points: usize) -> Vec<String> {
    (0..points)
        .map(|i| {
            (today - Duration::days((points - 1 - i) as i64))
                .format("%Y-%m-%d")
                .to_string()
        })
        .collect()
}

fn day_index(today: NaiveDate, points: usize, at: DateTime<Utc>) -> Option<usize> {
    let offset = (today - at.date_naive()).num_days();
    if offset < 0 || offset as usize >= points {
        return None;
    }
    Some(points - 1 - offset as usize)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

impl AnalyticsService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn automations(
        &self,
        organization_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<DiscoveredAutomation>> {
        self.store
            .automations
            .list(
                organization_id,
                &AutomationFilter {
                    include_inactive,
                    ..Default::default()
                },
            )
            .await
    }

    /// Daily severity counts and average score of newly discovered
    /// automations over the period
    pub async fn risk_trends(
        &self,
        organization_id: Uuid,
        period: Period,
        include_inactive: bool,
    ) -> Result<RiskTrends> {
        let points = period.points();
        let today = Utc::now().date_naive();
        let automations = self.automations(organization_id, include_inactive).await?;
        let risks = self.store.risks.current_for_org(organization_id).await?;

        let mut trends = RiskTrends {
            labels: day_labels(today, points),
            critical: vec![0; points],
            high: vec![0; points],
            medium: vec![0; points],
            low: vec![0; points],
            average_risk_score: vec![0.0; points],
        };
        let mut day_scores: Vec<Vec<f64>> = vec![Vec::new(); points];

        for automation in &automations {
            let Some(index) = day_index(today, points, automation.first_discovered_at) else {
                continue;
            };
            let (level, score) = risks
                .get(&automation.id)
                .map(|r| (r.risk_level, r.risk_score))
                .unwrap_or((Severity::Low, 0.0));
            match level {
                Severity::Critical => trends.critical[index] += 1,
                Severity::High => trends.high[index] += 1,
                Severity::Medium => trends.medium[index] += 1,
                Severity::Low => trends.low[index] += 1,
            }
            day_scores[index].push(score);
        }
        for (index, scores) in day_scores.iter().enumerate() {
            if !scores.is_empty() {
                trends.average_risk_score[index] =
                    round1(scores.iter().sum::<f64>() / scores.len() as f64);
            }
        }
        Ok(trends)
    }

    /// Counts and percentages by platform over the trailing 30 days
    pub async fn platform_distribution(
        &self,
        organization_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<PlatformSlice>> {
        let cutoff = Utc::now() - Duration::days(30);
        let automations = self.automations(organization_id, include_inactive).await?;
        let risks = self.store.risks.current_for_org(organization_id).await?;

        let recent: Vec<_> = automations
            .iter()
            .filter(|a| a.last_seen_at >= cutoff)
            .collect();
        let total = recent.len() as f64;

        let mut slices = Vec::new();
        for platform in Platform::all() {
            let mine: Vec<_> = recent.iter().filter(|a| a.platform == *platform).collect();
            let high_risk = mine
                .iter()
                .filter(|a| {
                    risks
                        .get(&a.id)
                        .is_some_and(|r| r.risk_level >= Severity::High)
                })
                .count() as u64;
            slices.push(PlatformSlice {
                platform: *platform,
                count: mine.len() as u64,
                percentage: if total > 0.0 {
                    round1(mine.len() as f64 / total * 100.0)
                } else {
                    0.0
                },
                high_risk_count: high_risk,
                color: platform.brand_color(),
            });
        }
        Ok(slices)
    }

    /// New and cumulative series plus the window growth rate
    pub async fn automation_growth(
        &self,
        organization_id: Uuid,
        period: Period,
        include_inactive: bool,
    ) -> Result<AutomationGrowth> {
        let points = period.points();
        let today = Utc::now().date_naive();
        let window_start = today - Duration::days(points as i64 - 1);
        let automations = self.automations(organization_id, include_inactive).await?;

        let mut new_series = vec![0u64; points];
        let mut before_window = 0u64;
        for automation in &automations {
            match day_index(today, points, automation.first_discovered_at) {
                Some(index) => new_series[index] += 1,
                None if automation.first_discovered_at.date_naive() < window_start => {
                    before_window += 1;
                }
                None => {}
            }
        }

        let mut cumulative = vec![0u64; points];
        let mut running = before_window;
        for (index, new_count) in new_series.iter().enumerate() {
            running += new_count;
            cumulative[index] = running;
        }
        let new_in_window: u64 = new_series.iter().sum();
        let growth_rate = if before_window > 0 {
            round1(new_in_window as f64 / before_window as f64 * 100.0)
        } else if new_in_window > 0 {
            100.0
        } else {
            0.0
        };

        Ok(AutomationGrowth {
            labels: day_labels(today, points),
            new_automations: new_series,
            cumulative,
            growth_rate,
        })
    }

    /// Up to `limit` active automations ranked worst-first
    pub async fn top_risks(&self, organization_id: Uuid, limit: usize) -> Result<Vec<TopRisk>> {
        let automations = self.automations(organization_id, false).await?;
        let risks = self.store.risks.current_for_org(organization_id).await?;

        let mut ranked: Vec<TopRisk> = automations
            .into_iter()
            .filter_map(|a| {
                let risk = risks.get(&a.id)?;
                Some(TopRisk {
                    automation_id: a.id,
                    name: a.name,
                    platform: a.platform,
                    vendor_name: a.vendor_name,
                    risk_level: risk.risk_level,
                    risk_score: risk.risk_score,
                    last_seen_at: a.last_seen_at,
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.risk_level
                .cmp(&a.risk_level)
                .then_with(|| {
                    b.risk_score
                        .partial_cmp(&a.risk_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Headline totals with deltas vs the previous period
    pub async fn summary(
        &self,
        organization_id: Uuid,
        period: Period,
        include_inactive: bool,
    ) -> Result<SummaryStats> {
        let automations = self.automations(organization_id, include_inactive).await?;
        let risks = self.store.risks.current_for_org(organization_id).await?;
        let now = Utc::now();
        let window = Duration::days(period.points() as i64 - 1);
        let window_start = now - window;
        let previous_start = window_start - window;

        let mut stats = SummaryStats {
            total_automations: automations.len() as u64,
            critical: 0,
            high: 0,
            medium: 0,
            low: 0,
            platforms: 0,
            affected_users: 0,
            new_this_period: 0,
            new_delta: 0,
        };
        let mut platforms = HashSet::new();
        let mut users = HashSet::new();
        let mut new_previous = 0u64;

        for automation in &automations {
            platforms.insert(automation.platform);
            if let Some(owner) = &automation.owner {
                users.insert(owner.clone());
            }
            if automation.first_discovered_at >= window_start {
                stats.new_this_period += 1;
            } else if automation.first_discovered_at >= previous_start {
                new_previous += 1;
            }
            match risks
                .get(&automation.id)
                .map(|r| r.risk_level)
                .unwrap_or(Severity::Low)
            {
                Severity::Critical => stats.critical += 1,
                Severity::High => stats.high += 1,
                Severity::Medium => stats.medium += 1,
                Severity::Low => stats.low += 1,
            }
        }
        stats.platforms = platforms.len() as u64;
        stats.affected_users = users.len() as u64;
        stats.new_delta = stats.new_this_period as i64 - new_previous as i64;
        Ok(stats)
    }

    /// `platform × severity` counts, one row per known platform
    pub async fn heatmap(
        &self,
        organization_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<HeatMapRow>> {
        let automations = self.automations(organization_id, include_inactive).await?;
        let risks = self.store.risks.current_for_org(organization_id).await?;

        let mut rows: Vec<HeatMapRow> = Platform::all()
            .iter()
            .map(|p| HeatMapRow {
                platform: *p,
                critical: 0,
                high: 0,
                medium: 0,
                low: 0,
            })
            .collect();
        for automation in &automations {
            let Some(row) = rows.iter_mut().find(|r| r.platform == automation.platform) else {
                continue;
            };
            match risks
                .get(&automation.id)
                .map(|r| r.risk_level)
                .unwrap_or(Severity::Low)
            {
                Severity::Critical => row.critical += 1,
                Severity::High => row.high += 1,
                Severity::Medium => row.medium += 1,
                Severity::Low => row.low += 1,
            }
        }
        Ok(rows)
    }

    /// Counts, percentages, and average risk per automation type
    pub async fn type_distribution(
        &self,
        organization_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<TypeSlice>> {
        let automations = self.automations(organization_id, include_inactive).await?;
        let risks = self.store.risks.current_for_org(organization_id).await?;
        let total = automations.len() as f64;

        let mut counts: HashMap<AutomationType, (u64, Vec<f64>)> = HashMap::new();
        for automation in &automations {
            let entry = counts.entry(automation.automation_type).or_default();
            entry.0 += 1;
            if let Some(risk) = risks.get(&automation.id) {
                entry.1.push(risk.risk_score);
            }
        }

        let mut slices: Vec<TypeSlice> = counts
            .into_iter()
            .map(|(automation_type, (count, scores))| TypeSlice {
                automation_type,
                count,
                percentage: if total > 0.0 {
                    round1(count as f64 / total * 100.0)
                } else {
                    0.0
                },
                average_risk_score: if scores.is_empty() {
                    0.0
                } else {
                    round1(scores.iter().sum::<f64>() / scores.len() as f64)
                },
            })
            .collect();
        slices.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_store::UpsertOutcome;

    async fn seed_automation(
        store: &Store,
        org: Uuid,
        platform: Platform,
        name: &str,
        days_ago: i64,
        risk: Option<(Severity, f64)>,
    ) -> DiscoveredAutomation {
        let conn = Uuid::new_v4();
        let run = Uuid::new_v4();
        let normalized = NormalizedAutomation {
            external_id: format!("ext-{name}"),
            automation_type: AutomationType::Bot,
            name: name.to_string(),
            platform_metadata: serde_json::json!({}),
            permissions: vec![],
            owner: Some(format!("{name}@acme.com")),
            vendor_name: None,
        };
        let at = Utc::now() - Duration::days(days_ago);
        let (automation, outcome) = store
            .automations
            .upsert(org, conn, run, platform, &normalized, at)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        if let Some((level, score)) = risk {
            store
                .risks
                .insert(RiskAssessment {
                    id: Uuid::new_v4(),
                    organization_id: org,
                    automation_id: automation.id,
                    risk_level: level,
                    risk_score: score,
                    sub_scores: RiskSubScores::default(),
                    assessed_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        automation
    }

    #[tokio::test]
    async fn empty_org_returns_zero_filled_series_of_declared_length() {
        let service = AnalyticsService::new(Store::memory());
        let org = Uuid::new_v4();

        for (period, expected) in [(Period::Week, 8), (Period::Month, 31), (Period::Quarter, 91)] {
            let trends = service.risk_trends(org, period, false).await.unwrap();
            assert_eq!(trends.labels.len(), expected);
            assert_eq!(trends.critical.len(), expected);
            assert_eq!(trends.average_risk_score.len(), expected);
            assert!(trends.average_risk_score.iter().all(|&v| v == 0.0));

            let growth = service.automation_growth(org, period, false).await.unwrap();
            assert_eq!(growth.new_automations.len(), expected);
            assert_eq!(growth.cumulative.len(), expected);
            assert_eq!(growth.growth_rate, 0.0);
        }

        let slices = service.platform_distribution(org, false).await.unwrap();
        assert_eq!(slices.len(), Platform::all().len());
        assert!(slices.iter().all(|s| s.count == 0 && s.percentage == 0.0));
    }

    #[tokio::test]
    async fn week_trend_has_values_only_on_discovery_days() {
        let store = Store::memory();
        let service = AnalyticsService::new(store.clone());
        let org = Uuid::new_v4();

        seed_automation(&store, org, Platform::Slack, "a", 5, Some((Severity::High, 75.0))).await;
        seed_automation(&store, org, Platform::Google, "b", 3, Some((Severity::Medium, 50.0))).await;
        seed_automation(&store, org, Platform::Slack, "c", 1, Some((Severity::Critical, 95.0))).await;

        let trends = service.risk_trends(org, Period::Week, false).await.unwrap();
        assert_eq!(trends.labels.len(), 8);

        // Day indexes: today is the last point
        let index_for = |days_ago: usize| 7 - days_ago;
        assert_eq!(trends.high[index_for(5)], 1);
        assert_eq!(trends.medium[index_for(3)], 1);
        assert_eq!(trends.critical[index_for(1)], 1);
        assert_eq!(trends.average_risk_score[index_for(5)], 75.0);
        assert_eq!(trends.average_risk_score[index_for(3)], 50.0);
        assert_eq!(trends.average_risk_score[index_for(1)], 95.0);

        let zero_days: Vec<usize> = (0..8).filter(|i| ![2, 4, 6].contains(i)).collect();
        for day in zero_days {
            assert_eq!(trends.average_risk_score[day], 0.0, "day {day} should be empty");
        }
    }

    #[tokio::test]
    async fn soft_expired_automations_are_excluded_unless_requested() {
        let store = Store::memory();
        let service = AnalyticsService::new(store.clone());
        let org = Uuid::new_v4();

        let kept = seed_automation(&store, org, Platform::Slack, "kept", 2, None).await;
        let expired = seed_automation(&store, org, Platform::Slack, "gone", 2, None).await;
        store
            .automations
            .deactivate_unseen(
                expired.connection_id,
                Uuid::new_v4(),
                Utc::now() + Duration::seconds(1),
            )
            .await
            .unwrap();

        let summary = service.summary(org, Period::Week, false).await.unwrap();
        assert_eq!(summary.total_automations, 1);

        let with_expired = service.summary(org, Period::Week, true).await.unwrap();
        assert_eq!(with_expired.total_automations, 2);
        let _ = kept;
    }

    #[tokio::test]
    async fn top_risks_rank_level_then_score_then_recency() {
        let store = Store::memory();
        let service = AnalyticsService::new(store.clone());
        let org = Uuid::new_v4();

        seed_automation(&store, org, Platform::Slack, "low", 1, Some((Severity::Low, 20.0))).await;
        seed_automation(&store, org, Platform::Slack, "high-60", 1, Some((Severity::High, 60.0))).await;
        seed_automation(&store, org, Platform::Slack, "high-80", 1, Some((Severity::High, 80.0))).await;
        seed_automation(&store, org, Platform::Google, "crit", 1, Some((Severity::Critical, 91.0))).await;

        let top = service.top_risks(org, 3).await.unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].name, "crit");
        assert_eq!(top[1].name, "high-80");
        assert_eq!(top[2].name, "high-60");
    }

    #[tokio::test]
    async fn growth_accumulates_and_heatmap_buckets_by_platform() {
        let store = Store::memory();
        let service = AnalyticsService::new(store.clone());
        let org = Uuid::new_v4();

        seed_automation(&store, org, Platform::Slack, "old", 40, Some((Severity::High, 70.0))).await;
        seed_automation(&store, org, Platform::Slack, "recent", 2, Some((Severity::Low, 10.0))).await;
        seed_automation(&store, org, Platform::Google, "newer", 1, Some((Severity::Critical, 92.0))).await;

        let growth = service.automation_growth(org, Period::Week, false).await.unwrap();
        assert_eq!(growth.new_automations.iter().sum::<u64>(), 2);
        assert_eq!(*growth.cumulative.last().unwrap(), 3);
        assert_eq!(growth.growth_rate, 200.0);

        let heatmap = service.heatmap(org, false).await.unwrap();
        let slack = heatmap.iter().find(|r| r.platform == Platform::Slack).unwrap();
        assert_eq!(slack.high, 1);
        assert_eq!(slack.low, 1);
        let google = heatmap.iter().find(|r| r.platform == Platform::Google).unwrap();
        assert_eq!(google.critical, 1);
    }

    #[tokio::test]
    async fn type_distribution_percentages_sum_to_hundred() {
        let store = Store::memory();
        let service = AnalyticsService::new(store.clone());
        let org = Uuid::new_v4();

        for name in ["a", "b", "c", "d"] {
            seed_automation(&store, org, Platform::Slack, name, 1, Some((Severity::Low, 10.0))).await;
        }
        let slices = service.type_distribution(org, false).await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].automation_type, AutomationType::Bot);
        assert_eq!(slices[0].percentage, 100.0);
        assert_eq!(slices[0].average_risk_score, 10.0);
    }
}
