//! Umbra server binary
//!
//! Composition root: configuration snapshot, store selection, connector
//! registry, vault, hub, engine, scheduler, and the HTTP surface.

use anyhow::Result;
use clap::Parser;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use umbra_analytics::AnalyticsService;
use umbra_core::UmbraConfig;
use umbra_discovery::{ConnectionManager, ConnectorRegistry, DiscoveryEngine, Scheduler};
use umbra_gateway::{server, AppState};
use umbra_realtime::{Hub, TokenVerifier};
use umbra_store::{schema, Store};
use umbra_vault::{CredentialVault, DerivedKeyProvider};

#[derive(Parser, Debug)]
#[command(name = "umbra-gateway", about = "Umbra shadow-AI discovery platform server")]
struct Args {
    /// Bind address; overrides UMBRA_BIND_ADDR
    #[arg(long)]
    bind: Option<String>,

    /// Skip the background scheduler (useful for one-off API instances)
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "umbra=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = Arc::new(UmbraConfig::from_env()?);

    // Store: Postgres when configured, in-memory otherwise
    let store = match &cfg.database.url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(cfg.database.max_connections)
                .connect(url)
                .await?;
            schema::migrate(&pool).await?;
            tracing::info!("connected to postgres");
            Store::postgres(pool)
        }
        None => {
            tracing::warn!("UMBRA_DATABASE_URL not set; using the in-memory store");
            Store::memory()
        }
    };

    // Vault root key; generated ephemerally when unset so dev instances
    // still come up (credentials then die with the process)
    let keys = if cfg.vault.master_key_b64.is_empty() {
        tracing::warn!("UMBRA_VAULT_MASTER_KEY not set; generating an ephemeral root key");
        let mut root = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut root);
        DerivedKeyProvider::new(root, cfg.vault.key_version)
    } else {
        DerivedKeyProvider::from_base64(&cfg.vault.master_key_b64, cfg.vault.key_version)
            .map_err(|e| anyhow::anyhow!("vault key: {e}"))?
    };
    let vault = Arc::new(CredentialVault::new(Arc::new(keys), store.credentials.clone()));

    let registry = Arc::new(ConnectorRegistry::standard(&cfg));
    let manager = Arc::new(ConnectionManager::new(
        store.clone(),
        vault,
        registry.clone(),
        &cfg.server.jwt_secret,
    ));

    let hub = Arc::new(Hub::new(cfg.realtime.clone()));
    let _reaper = hub.clone().start_reaper();

    let engine = Arc::new(DiscoveryEngine::new(
        store.clone(),
        manager.clone(),
        registry,
        hub.clone(),
        cfg.clone(),
    ));

    if args.no_scheduler {
        tracing::info!("scheduler disabled by flag");
    } else {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            engine.clone(),
            manager.clone(),
            cfg.clone(),
        ));
        let _scheduler = scheduler.start();
    }

    let verifier = TokenVerifier::new(&cfg.server.jwt_secret, &cfg.server.jwt_audience);
    let state = AppState {
        store: store.clone(),
        engine,
        manager,
        analytics: AnalyticsService::new(store),
        hub,
        verifier,
        cfg: cfg.clone(),
    };

    let addr: SocketAddr = args
        .bind
        .unwrap_or_else(|| cfg.server.bind_addr.clone())
        .parse()?;
    server::run(state, addr).await
}
