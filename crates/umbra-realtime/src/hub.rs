//! Session hub
//!
//! Holds every authenticated socket session, routes published events by
//! `(organization_id, topic)`, and reaps silent peers. Delivery to one
//! subscriber preserves publish order through its bounded queue; delivery
//! across subscribers carries no global order.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use umbra_core::config::RealtimeConfig;
use umbra_core::events::{EventSink, RealtimeEvent, Topic};
use umbra_core::types::UserRole;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::protocol::{role_topics, Outbound};

struct Session {
    organization_id: Uuid,
    role: UserRole,
    topics: Mutex<HashSet<Topic>>,
    tx: mpsc::Sender<Outbound>,
    last_seen: Mutex<Instant>,
}

/// Hub statistics for the performance-metrics topic
#[derive(Debug, Clone, serde::Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped_slow: u64,
}

pub struct Hub {
    sessions: DashMap<Uuid, Session>,
    cfg: RealtimeConfig,
    published: std::sync::atomic::AtomicU64,
    delivered: std::sync::atomic::AtomicU64,
    dropped_slow: std::sync::atomic::AtomicU64,
}

impl Hub {
    pub fn new(cfg: RealtimeConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            cfg,
            published: Default::default(),
            delivered: Default::default(),
            dropped_slow: Default::default(),
        }
    }

    /// Register an authenticated session; returns its id, starting
    /// subscriptions, and the outbound queue to pump into the socket
    pub fn register(&self, auth: &AuthContext) -> (Uuid, Vec<Topic>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity);
        let topics = role_topics(auth.role);
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            Session {
                organization_id: auth.organization_id,
                role: auth.role,
                topics: Mutex::new(topics.iter().copied().collect()),
                tx,
                last_seen: Mutex::new(Instant::now()),
            },
        );
        tracing::info!(session = %id, organization = %auth.organization_id, role = ?auth.role, "realtime session registered");
        (id, topics, rx)
    }

    pub fn unregister(&self, session_id: Uuid) {
        if self.sessions.remove(&session_id).is_some() {
            tracing::info!(session = %session_id, "realtime session closed");
        }
    }

    /// Record liveness for the reaper
    pub fn touch(&self, session_id: Uuid) {
        if let Some(session) = self.sessions.get(&session_id) {
            *session.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        }
    }

    /// Replace a session's subscriptions, clipped to its role's allowance.
    /// Returns the resulting set.
    pub fn update_subscriptions(&self, session_id: Uuid, requested: &[Topic]) -> Option<Vec<Topic>> {
        let session = self.sessions.get(&session_id)?;
        let allowed: HashSet<Topic> = role_topics(session.role).into_iter().collect();
        let mut seen = HashSet::new();
        let result: Vec<Topic> = requested
            .iter()
            .copied()
            .filter(|t| allowed.contains(t) && seen.insert(*t))
            .collect();
        *session.topics.lock().unwrap_or_else(|e| e.into_inner()) = seen;
        Some(result)
    }

    /// Queue an event to every matching subscriber of its organization
    pub async fn publish_event(&self, event: RealtimeEvent) {
        use std::sync::atomic::Ordering;
        self.published.fetch_add(1, Ordering::Relaxed);
        let topic = event.kind.topic();

        for session in self.sessions.iter() {
            if session.organization_id != event.organization_id {
                continue;
            }
            let subscribed = session
                .topics
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&topic);
            if !subscribed {
                continue;
            }
            match session.tx.try_send(Outbound::Event(event.clone())) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // A stalled consumer must not stall the publisher
                    self.dropped_slow.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(session = %session.key(), "outbound queue full; event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Queue an outbound message onto one session, dropping on a full queue
    pub(crate) fn try_send(&self, session_id: Uuid, outbound: Outbound) {
        if let Some(session) = self.sessions.get(&session_id) {
            let _ = session.tx.try_send(outbound);
        }
    }

    /// Remove sessions silent past the idle timeout; their queues close and
    /// the socket pumps exit
    pub fn reap_idle(&self) -> usize {
        let timeout = Duration::from_secs(self.cfg.idle_timeout_sec);
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| {
                now.duration_since(*s.last_seen.lock().unwrap_or_else(|e| e.into_inner())) > timeout
            })
            .map(|s| *s.key())
            .collect();
        for id in &stale {
            tracing::info!(session = %id, "reaping idle realtime session");
            self.sessions.remove(id);
        }
        stale.len()
    }

    /// Spawn the periodic reaper; the handle lives as long as the server
    pub fn start_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let hub = self;
        let interval = Duration::from_secs(hub.cfg.heartbeat_interval_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                hub.reap_idle();
            }
        })
    }

    pub fn stats(&self) -> HubStats {
        use std::sync::atomic::Ordering;
        HubStats {
            sessions: self.sessions.len(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_slow: self.dropped_slow.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventSink for Hub {
    async fn publish(&self, event: RealtimeEvent) {
        self.publish_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::events::EventKind;

    fn hub() -> Hub {
        Hub::new(RealtimeConfig {
            idle_timeout_sec: 120,
            heartbeat_interval_sec: 30,
            channel_capacity: 8,
        })
    }

    fn auth(org: Uuid, role: UserRole) -> AuthContext {
        AuthContext {
            user_id: "user".to_string(),
            organization_id: org,
            role,
        }
    }

    fn event(org: Uuid, kind: EventKind) -> RealtimeEvent {
        RealtimeEvent::new(kind, org, serde_json::json!({}))
    }

    #[tokio::test]
    async fn events_are_delivered_only_to_the_owning_org() {
        let hub = hub();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let (_, _, mut rx_a) = hub.register(&auth(org_a, UserRole::Admin));
        let (_, _, mut rx_b) = hub.register(&auth(org_b, UserRole::Admin));

        hub.publish_event(event(org_a, EventKind::CorrelationStarted)).await;

        let delivered = rx_a.try_recv().unwrap();
        match delivered {
            Outbound::Event(e) => assert_eq!(e.organization_id, org_a),
            other => panic!("expected event, got {other:?}"),
        }
        assert!(rx_b.try_recv().is_err(), "cross-org delivery");
    }

    #[tokio::test]
    async fn topic_filter_respects_role_profile() {
        let hub = hub();
        let org = Uuid::new_v4();
        // CISO profile has no analysisProgress
        let (_, _, mut rx) = hub.register(&auth(org, UserRole::Ciso));

        hub.publish_event(event(org, EventKind::DiscoveryProgress)).await;
        assert!(rx.try_recv().is_err());

        hub.publish_event(event(org, EventKind::RiskChanged)).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn narrowing_is_clipped_to_the_role_allowance() {
        let hub = hub();
        let org = Uuid::new_v4();
        let (id, initial, mut rx) = hub.register(&auth(org, UserRole::Viewer));
        assert_eq!(initial.len(), 2);

        // Viewer may keep riskAlerts but cannot acquire executiveUpdates
        let granted = hub
            .update_subscriptions(id, &[Topic::RiskAlerts, Topic::ExecutiveUpdates])
            .unwrap();
        assert_eq!(granted, vec![Topic::RiskAlerts]);

        hub.publish_event(event(org, EventKind::CorrelationStarted)).await;
        assert!(rx.try_recv().is_err(), "dropped topic still delivered");
        hub.publish_event(event(org, EventKind::DetectionNew)).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn per_subscriber_delivery_preserves_publish_order() {
        let hub = hub();
        let org = Uuid::new_v4();
        let (_, _, mut rx) = hub.register(&auth(org, UserRole::Admin));

        for i in 0..5 {
            hub.publish_event(RealtimeEvent::new(
                EventKind::DiscoveryProgress,
                org,
                serde_json::json!({"seq": i}),
            ))
            .await;
        }
        for expected in 0..5 {
            match rx.try_recv().unwrap() {
                Outbound::Event(e) => assert_eq!(e.payload["seq"], expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_consumers_drop_rather_than_block() {
        let hub = hub();
        let org = Uuid::new_v4();
        let (_, _, _rx) = hub.register(&auth(org, UserRole::Admin));

        // Capacity is 8; the publisher must never suspend on a full queue
        for _ in 0..20 {
            hub.publish_event(event(org, EventKind::RiskChanged)).await;
        }
        let stats = hub.stats();
        assert_eq!(stats.published, 20);
        assert_eq!(stats.delivered, 8);
        assert_eq!(stats.dropped_slow, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_reaped() {
        let hub = hub();
        let org = Uuid::new_v4();
        let (id, _, _rx) = hub.register(&auth(org, UserRole::Admin));
        assert_eq!(hub.stats().sessions, 1);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(hub.reap_idle(), 1);
        assert_eq!(hub.stats().sessions, 0);

        // Touching keeps a session alive
        let (id2, _, _rx2) = hub.register(&auth(org, UserRole::Admin));
        tokio::time::advance(Duration::from_secs(100)).await;
        hub.touch(id2);
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(hub.reap_idle(), 0);
        let _ = id;
    }
}
