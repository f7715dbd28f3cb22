//! Umbra persistence layer
//!
//! Repository contracts over the relational store with per-tenant row-level
//! isolation, plus two interchangeable backends: Postgres (sqlx) for
//! production and an in-memory store for tests and database-less runs.

pub mod memory;
pub mod postgres;
pub mod repos;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repos::*;

use std::sync::Arc;
use umbra_vault::CredentialRecordRepo;

/// Aggregated handle over every repository; cheap to clone
#[derive(Clone)]
pub struct Store {
    pub organizations: Arc<dyn OrganizationRepo>,
    pub connections: Arc<dyn ConnectionRepo>,
    pub transitions: Arc<dyn TransitionRepo>,
    pub runs: Arc<dyn RunRepo>,
    pub automations: Arc<dyn AutomationRepo>,
    pub detections: Arc<dyn DetectionRepo>,
    pub risks: Arc<dyn RiskRepo>,
    pub feedback: Arc<dyn FeedbackRepo>,
    pub baselines: Arc<dyn BaselineRepo>,
    pub chains: Arc<dyn ChainRepo>,
    pub audit: Arc<dyn AuditRepo>,
    pub activity: Arc<dyn ActivityRepo>,
    pub credentials: Arc<dyn CredentialRecordRepo>,
}

impl Store {
    /// In-memory backend
    pub fn memory() -> Self {
        let inner = Arc::new(MemoryStore::new());
        Self {
            organizations: inner.clone(),
            connections: inner.clone(),
            transitions: inner.clone(),
            runs: inner.clone(),
            automations: inner.clone(),
            detections: inner.clone(),
            risks: inner.clone(),
            feedback: inner.clone(),
            baselines: inner.clone(),
            chains: inner.clone(),
            audit: inner.clone(),
            activity: inner.clone(),
            credentials: inner,
        }
    }

    /// Postgres backend over an existing pool; apply [`schema::migrate`]
    /// before first use
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let inner = Arc::new(PgStore::new(pool));
        Self {
            organizations: inner.clone(),
            connections: inner.clone(),
            transitions: inner.clone(),
            runs: inner.clone(),
            automations: inner.clone(),
            detections: inner.clone(),
            risks: inner.clone(),
            feedback: inner.clone(),
            baselines: inner.clone(),
            chains: inner.clone(),
            audit: inner.clone(),
            activity: inner.clone(),
            credentials: inner,
        }
    }
}
