//! Periodic scheduler
//!
//! One ticking task covers three duties: discovery runs at each
//! organization's configured frequency, health checks whose cadence backs
//! off for connections that are not connected, and pre-expiry refreshes.

use chrono::{Duration, Utc};
use std::sync::Arc;
use umbra_core::types::*;
use umbra_core::{Result, UmbraConfig};
use umbra_store::Store;
use uuid::Uuid;

use crate::connection::{ConnectionManager, REFRESH_LEAD_SECS};
use crate::engine::DiscoveryEngine;

/// Seconds between scheduler ticks
const TICK_SECS: u64 = 60;
/// Health-check cadence for connected connections
const HEALTH_INTERVAL_MINS: i64 = 5;
/// Backed-off cadence for everything else
const HEALTH_BACKOFF_MINS: i64 = 30;

pub struct Scheduler {
    store: Store,
    engine: Arc<DiscoveryEngine>,
    manager: Arc<ConnectionManager>,
    cfg: Arc<UmbraConfig>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        engine: Arc<DiscoveryEngine>,
        manager: Arc<ConnectionManager>,
        cfg: Arc<UmbraConfig>,
    ) -> Self {
        Self {
            store,
            engine,
            manager,
            cfg,
        }
    }

    /// Spawn the periodic loop; runs until the server exits
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(TICK_SECS));
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick().await {
                    tracing::error!(error = %err, "scheduler tick failed");
                }
            }
        })
    }

    /// One pass over every connection
    pub async fn tick(&self) -> Result<()> {
        let connections = self.store.connections.list_all().await?;
        for conn in connections {
            if let Err(err) = self.service_connection(&conn).await {
                tracing::warn!(connection = %conn.id, error = %err, "scheduler pass failed for connection");
            }
        }
        Ok(())
    }

    async fn service_connection(&self, conn: &PlatformConnection) -> Result<()> {
        if conn.status == ConnectionStatus::Disconnected {
            return Ok(());
        }

        // Health checks, with back-off when not connected
        let cadence = if conn.status == ConnectionStatus::Connected {
            Duration::minutes(HEALTH_INTERVAL_MINS)
        } else {
            Duration::minutes(HEALTH_BACKOFF_MINS)
        };
        let due = conn
            .health
            .last_checked
            .map(|last| Utc::now() - last >= cadence)
            .unwrap_or(true);
        if due && conn.status != ConnectionStatus::Expired {
            let _ = self.manager.health_check(conn).await;
        }

        if conn.status != ConnectionStatus::Connected {
            // Expired connections wait for re-authorization; discovery is
            // suppressed
            return Ok(());
        }

        // Pre-expiry refresh
        if let Ok(creds) = self.engine_credentials_peek(conn.id).await {
            if creds.expires_within(Utc::now(), REFRESH_LEAD_SECS) {
                if let Err(err) = self.manager.refresh_credentials(conn).await {
                    tracing::warn!(connection = %conn.id, error = %err, "scheduled refresh failed");
                    return Ok(());
                }
            }
        }

        // Scheduled discovery at the organization's frequency
        let frequency = self
            .store
            .organizations
            .get(conn.organization_id)
            .await?
            .map(|org| org.settings.discovery_frequency_hours)
            .unwrap_or(self.cfg.discovery.default_frequency_hours);
        let last_run = self
            .store
            .runs
            .list_for_connection(conn.id, 1)
            .await?
            .into_iter()
            .next();
        let due = match last_run {
            Some(run) => Utc::now() - run.created_at >= Duration::hours(i64::from(frequency)),
            None => true,
        };
        if due {
            match self
                .engine
                .clone()
                .trigger_run(conn.organization_id, conn.id, RunTrigger::Scheduled)
                .await
            {
                Ok(run) => tracing::info!(connection = %conn.id, run = %run.id, "scheduled discovery run"),
                Err(err) if err.kind() == "Conflict" => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn engine_credentials_peek(&self, connection_id: Uuid) -> Result<OAuthCredentials> {
        self.manager.peek_credentials(connection_id).await
    }
}
