//! Behavioral baseline & reinforcement
//!
//! Learns per-organization velocity, business-hour, permission, and
//! automation-type profiles, updates them with an exponential moving
//! average, and tunes detector thresholds from analyst feedback with
//! clamped steps so the loop cannot oscillate.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::collections::HashMap;
use umbra_core::config::BaselineConfig;
use umbra_core::types::*;
use uuid::Uuid;

/// Confidence never exceeds this ceiling
const CONFIDENCE_CEILING: f64 = 0.95;
/// Share of activity the learned business window must cover
const WINDOW_COVERAGE: f64 = 0.8;

/// Clamp bounds for the reinforcement loop
const VELOCITY_Z_BOUNDS: (f64, f64) = (2.0, 6.0);
const BATCH_MIN_BOUNDS: (u32, u32) = (3, 20);
const TIMING_CV_BOUNDS: (f64, f64) = (0.01, 0.2);
const DATA_FACTOR_BOUNDS: (f64, f64) = (1.5, 10.0);

pub struct BaselineEngine {
    cfg: BaselineConfig,
}

impl BaselineEngine {
    pub fn new(cfg: BaselineConfig) -> Self {
        Self { cfg }
    }

    /// Confidence as a monotone function of sample count
    pub fn confidence_for(&self, sample_size: u64) -> f64 {
        let n = sample_size as f64;
        (n / (n + self.cfg.min_sample_size as f64)).min(CONFIDENCE_CEILING)
    }

    /// Build a fresh baseline from recent automations and their events
    pub fn build(
        &self,
        organization_id: Uuid,
        automations: &[DiscoveredAutomation],
        events: &[ActivityEvent],
        now: DateTime<Utc>,
    ) -> BehavioralBaseline {
        let sample_size = automations.len() as u64;
        let (velocity_mean, velocity_std) = hourly_velocity(events);
        let business_window = learn_business_window(events);

        let mut permission_counts: HashMap<String, u64> = HashMap::new();
        let mut type_counts: HashMap<String, u64> = HashMap::new();
        for automation in automations {
            *type_counts
                .entry(automation.automation_type.as_str().to_string())
                .or_default() += 1;
            for scope in &automation.permissions {
                *permission_counts.entry(scope.clone()).or_default() += 1;
            }
        }
        let denom = sample_size.max(1) as f64;
        let common_permissions = permission_counts
            .into_iter()
            .map(|(scope, count)| (scope, count as f64 / denom))
            .collect();
        let type_distribution = type_counts
            .into_iter()
            .map(|(kind, count)| (kind, count as f64 / denom))
            .collect();

        let status = if sample_size >= self.cfg.min_sample_size {
            BaselineStatus::Established
        } else {
            BaselineStatus::Learning
        };

        BehavioralBaseline {
            organization_id,
            velocity_mean,
            velocity_std,
            business_window,
            common_permissions,
            type_distribution,
            sample_size,
            confidence: self.confidence_for(sample_size),
            status,
            last_updated: now,
            next_update_due: now + Duration::hours(24),
        }
    }

    /// Fold a freshly built baseline into the existing one with EMA so a
    /// drifting environment is tracked without oscillation
    pub fn update(
        &self,
        existing: &BehavioralBaseline,
        fresh: &BehavioralBaseline,
        now: DateTime<Utc>,
    ) -> BehavioralBaseline {
        let rate = self.cfg.adaptation_rate;
        let blend = |old: f64, new: f64| (1.0 - rate) * old + rate * new;

        let mut common_permissions = existing.common_permissions.clone();
        for (scope, share) in &fresh.common_permissions {
            let entry = common_permissions.entry(scope.clone()).or_insert(0.0);
            *entry = blend(*entry, *share);
        }
        let mut type_distribution = existing.type_distribution.clone();
        for (kind, share) in &fresh.type_distribution {
            let entry = type_distribution.entry(kind.clone()).or_insert(0.0);
            *entry = blend(*entry, *share);
        }

        let sample_size = existing.sample_size + fresh.sample_size;
        let status = if sample_size >= self.cfg.min_sample_size {
            BaselineStatus::Established
        } else {
            BaselineStatus::Learning
        };

        BehavioralBaseline {
            organization_id: existing.organization_id,
            velocity_mean: blend(existing.velocity_mean, fresh.velocity_mean),
            velocity_std: blend(existing.velocity_std, fresh.velocity_std),
            business_window: BusinessWindow {
                start_hour: blend(
                    f64::from(existing.business_window.start_hour),
                    f64::from(fresh.business_window.start_hour),
                )
                .round() as u8,
                end_hour: blend(
                    f64::from(existing.business_window.end_hour),
                    f64::from(fresh.business_window.end_hour),
                )
                .round() as u8,
                weekdays: fresh.business_window.weekdays,
            },
            common_permissions,
            type_distribution,
            sample_size,
            confidence: self.confidence_for(sample_size),
            status,
            last_updated: now,
            next_update_due: now + Duration::hours(24),
        }
    }

    /// Tune thresholds from analyst feedback. False positives raise the
    /// offending detector's bar; confirmed detections lower it. Every step
    /// is clamped.
    pub fn adjust_thresholds(
        &self,
        current: &DetectorThresholds,
        feedback: &[AutomationFeedback],
    ) -> DetectorThresholds {
        let mut out = current.clone();
        for item in feedback {
            let pattern = item
                .detection_snapshot
                .get("patternType")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            match (item.feedback_type, pattern) {
                (FeedbackType::FalsePositive, "velocity") => out.velocity_z_score += 0.25,
                (FeedbackType::TruePositive | FeedbackType::FalseNegative, "velocity") => {
                    out.velocity_z_score -= 0.1;
                }
                (FeedbackType::FalsePositive, "batch_operation") => out.batch_min_size += 1,
                (FeedbackType::TruePositive | FeedbackType::FalseNegative, "batch_operation") => {
                    out.batch_min_size = out.batch_min_size.saturating_sub(1);
                }
                (FeedbackType::FalsePositive, "timing_variance") => {
                    out.timing_variance_max_cv -= 0.01;
                }
                (FeedbackType::TruePositive | FeedbackType::FalseNegative, "timing_variance") => {
                    out.timing_variance_max_cv += 0.005;
                }
                (FeedbackType::FalsePositive, "data_volume") => out.data_volume_factor += 0.5,
                (FeedbackType::TruePositive | FeedbackType::FalseNegative, "data_volume") => {
                    out.data_volume_factor -= 0.2;
                }
                _ => {}
            }
        }
        out.velocity_z_score = out.velocity_z_score.clamp(VELOCITY_Z_BOUNDS.0, VELOCITY_Z_BOUNDS.1);
        out.batch_min_size = out.batch_min_size.clamp(BATCH_MIN_BOUNDS.0, BATCH_MIN_BOUNDS.1);
        out.timing_variance_max_cv = out
            .timing_variance_max_cv
            .clamp(TIMING_CV_BOUNDS.0, TIMING_CV_BOUNDS.1);
        out.data_volume_factor = out
            .data_volume_factor
            .clamp(DATA_FACTOR_BOUNDS.0, DATA_FACTOR_BOUNDS.1);
        out
    }
}

/// Mean and σ of events-per-hour over the event span, zeros included
fn hourly_velocity(events: &[ActivityEvent]) -> (f64, f64) {
    if events.is_empty() {
        return (0.0, 0.0);
    }
    let mut buckets: HashMap<i64, u64> = HashMap::new();
    let mut min_hour = i64::MAX;
    let mut max_hour = i64::MIN;
    for event in events {
        let hour = event.occurred_at.timestamp() / 3600;
        min_hour = min_hour.min(hour);
        max_hour = max_hour.max(hour);
        *buckets.entry(hour).or_default() += 1;
    }
    let span = (max_hour - min_hour + 1).max(1);
    let counts: Vec<f64> = (min_hour..=max_hour)
        .map(|h| buckets.get(&h).copied().unwrap_or(0) as f64)
        .collect();
    let mean = counts.iter().sum::<f64>() / span as f64;
    let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / span as f64;
    (mean, variance.sqrt())
}

/// Learn the hour range covering most activity plus the active weekdays
fn learn_business_window(events: &[ActivityEvent]) -> BusinessWindow {
    if events.is_empty() {
        return BusinessWindow::default();
    }
    let mut hour_counts = [0u64; 24];
    let mut weekday_counts = [0u64; 7];
    for event in events {
        hour_counts[event.occurred_at.hour() as usize] += 1;
        weekday_counts[event.occurred_at.weekday().num_days_from_monday() as usize] += 1;
    }
    let total: u64 = hour_counts.iter().sum();

    // Busiest hours first until coverage is reached, then take their span
    let mut ranked: Vec<usize> = (0..24).collect();
    ranked.sort_by_key(|&h| std::cmp::Reverse(hour_counts[h]));
    let mut covered = 0u64;
    let mut chosen: Vec<usize> = Vec::new();
    for hour in ranked {
        if covered as f64 >= total as f64 * WINDOW_COVERAGE {
            break;
        }
        covered += hour_counts[hour];
        chosen.push(hour);
    }
    let start_hour = chosen.iter().copied().min().unwrap_or(8) as u8;
    let end_hour = (chosen.iter().copied().max().unwrap_or(17) + 1) as u8;

    let mut weekdays = [false; 7];
    let weekday_total: u64 = weekday_counts.iter().sum();
    for (day, count) in weekday_counts.iter().enumerate() {
        weekdays[day] = *count as f64 >= weekday_total as f64 * 0.02;
    }

    BusinessWindow {
        start_hour,
        end_hour,
        weekdays,
    }
}
