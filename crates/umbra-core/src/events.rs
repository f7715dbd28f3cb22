//! Real-time event model and publish seam
//!
//! The discovery pipeline publishes through [`EventSink`] so it never depends
//! on the hub implementation; the hub routes on `(organization_id, topic)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription topics, gated per user role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Topic {
    AnalysisProgress,
    ChainDetection,
    RiskAlerts,
    ExecutiveUpdates,
    PerformanceMetrics,
}

impl Topic {
    pub fn all() -> &'static [Topic] {
        &[
            Topic::AnalysisProgress,
            Topic::ChainDetection,
            Topic::RiskAlerts,
            Topic::ExecutiveUpdates,
            Topic::PerformanceMetrics,
        ]
    }
}

/// Server-published event kinds and their wire names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "discovery.started")]
    DiscoveryStarted,
    #[serde(rename = "discovery.progress")]
    DiscoveryProgress,
    #[serde(rename = "detection.new")]
    DetectionNew,
    #[serde(rename = "risk.changed")]
    RiskChanged,
    #[serde(rename = "correlation:started")]
    CorrelationStarted,
    #[serde(rename = "correlation:chain")]
    CorrelationChain,
    #[serde(rename = "discovery.completed")]
    DiscoveryCompleted,
    #[serde(rename = "executive.summary")]
    ExecutiveSummary,
    #[serde(rename = "hub.metrics")]
    HubMetrics,
}

impl EventKind {
    /// Topic a kind is routed under
    pub fn topic(&self) -> Topic {
        match self {
            EventKind::DiscoveryStarted
            | EventKind::DiscoveryProgress
            | EventKind::DiscoveryCompleted => Topic::AnalysisProgress,
            EventKind::DetectionNew | EventKind::RiskChanged => Topic::RiskAlerts,
            EventKind::CorrelationStarted | EventKind::CorrelationChain => Topic::ChainDetection,
            EventKind::ExecutiveSummary => Topic::ExecutiveUpdates,
            EventKind::HubMetrics => Topic::PerformanceMetrics,
        }
    }
}

/// An event addressed to one organization's subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "organizationId")]
    pub organization_id: Uuid,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(kind: EventKind, organization_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            kind,
            organization_id,
            payload,
            ts: Utc::now(),
        }
    }
}

/// Publish seam between producers and the hub
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: RealtimeEvent);
}

/// Sink that drops everything; used in tests and headless runs
#[derive(Debug, Default, Clone)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: RealtimeEvent) {}
}

/// Sink that records events in memory for assertions
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: tokio::sync::Mutex<Vec<RealtimeEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RealtimeEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: RealtimeEvent) {
        self.events.lock().await.push(event);
    }
}
