//! Router assembly and serving

use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

/// Build the full API surface over shared state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(handlers::ws_upgrade))
        .route("/api/connections", get(handlers::list_connections))
        .route(
            "/api/connections/:connection_id",
            delete(handlers::disconnect_connection),
        )
        .route(
            "/api/auth/oauth/:platform/authorize",
            post(handlers::begin_oauth),
        )
        .route("/api/auth/callback/:platform", get(handlers::oauth_callback))
        .route(
            "/api/discovery/:connection_id",
            post(handlers::trigger_discovery),
        )
        .route(
            "/api/discovery/runs/:run_id",
            get(handlers::get_run).delete(handlers::cancel_run),
        )
        .route("/api/automations", get(handlers::list_automations))
        .route("/api/automations/:id", get(handlers::automation_detail))
        .route(
            "/api/automations/:id/vendor",
            post(handlers::override_vendor),
        )
        .route("/api/feedback", post(handlers::submit_feedback))
        .route("/api/analytics/:report", get(handlers::analytics_report))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until shutdown
pub async fn run(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("umbra gateway listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::util::ServiceExt;
    use umbra_analytics::AnalyticsService;
    use umbra_connectors::mock::MockConnector;
    use umbra_core::types::*;
    use umbra_core::UmbraConfig;
    use umbra_discovery::{ConnectionManager, ConnectorRegistry, DiscoveryEngine};
    use umbra_realtime::{Hub, TokenVerifier};
    use umbra_store::Store;
    use umbra_vault::{CredentialVault, DerivedKeyProvider};
    use uuid::Uuid;

    struct TestApp {
        router: Router,
        state: AppState,
    }

    fn test_app() -> TestApp {
        let cfg = Arc::new(UmbraConfig::from_env().unwrap());
        let store = Store::memory();
        let vault = Arc::new(CredentialVault::new(
            Arc::new(DerivedKeyProvider::random(1)),
            store.credentials.clone(),
        ));
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(MockConnector::new(Platform::Slack)));
        let registry = Arc::new(registry);
        let manager = Arc::new(ConnectionManager::new(
            store.clone(),
            vault,
            registry.clone(),
            &cfg.server.jwt_secret,
        ));
        let hub = Arc::new(Hub::new(cfg.realtime.clone()));
        let engine = Arc::new(DiscoveryEngine::new(
            store.clone(),
            manager.clone(),
            registry,
            hub.clone(),
            cfg.clone(),
        ));
        let verifier = TokenVerifier::new(&cfg.server.jwt_secret, &cfg.server.jwt_audience);
        let state = AppState {
            store: store.clone(),
            engine,
            manager,
            analytics: AnalyticsService::new(store),
            hub,
            verifier,
            cfg,
        };
        TestApp {
            router: build_router(state.clone()),
            state,
        }
    }

    fn bearer(app: &TestApp, org: Uuid, role: UserRole) -> String {
        format!(
            "Bearer {}",
            app.state.verifier.issue("test-user", org, role, 300).unwrap()
        )
    }

    async fn get_json(
        app: &TestApp,
        path: &str,
        auth: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().uri(path).method("GET");
        if let Some(auth) = auth {
            request = request.header("Authorization", auth);
        }
        let response = app
            .router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn seed_automation(
        store: &Store,
        org: Uuid,
        platform: Platform,
        name: &str,
        scopes: usize,
        risk: Option<(Severity, f64)>,
    ) -> DiscoveredAutomation {
        let normalized = NormalizedAutomation {
            external_id: format!("ext-{name}"),
            automation_type: AutomationType::OauthApp,
            name: name.to_string(),
            platform_metadata: serde_json::json!({}),
            permissions: (0..scopes).map(|i| format!("scope:{i}")).collect(),
            owner: None,
            vendor_name: umbra_core::vendor::extract_vendor_name(name),
        };
        let (automation, _) = store
            .automations
            .upsert(
                org,
                Uuid::new_v4(),
                Uuid::new_v4(),
                platform,
                &normalized,
                chrono::Utc::now(),
            )
            .await
            .unwrap();
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
                    assessed_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }
        automation
    }

    #[tokio::test]
    async fn missing_token_yields_the_error_envelope() {
        let app = test_app();
        let (status, body) = get_json(&app, "/api/automations", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "AuthRequired");
    }

    #[tokio::test]
    async fn garbage_token_is_rejected_as_token_invalid() {
        let app = test_app();
        let (status, body) =
            get_json(&app, "/api/automations", Some("Bearer not.a.token")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "TokenInvalid");
    }

    #[tokio::test]
    async fn invalid_group_by_is_a_400_validation_error() {
        let app = test_app();
        let org = Uuid::new_v4();
        let auth = bearer(&app, org, UserRole::Admin);
        let (status, body) =
            get_json(&app, "/api/automations?groupBy=owner", Some(&auth)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationFailed");
        assert_eq!(body["details"]["field"], "groupBy");
    }

    #[tokio::test]
    async fn vendor_grouping_merges_same_vendor_applications() {
        let app = test_app();
        let org = Uuid::new_v4();
        seed_automation(&app.state.store, org, Platform::Google, "Attio", 3, Some((Severity::Medium, 50.0))).await;
        seed_automation(&app.state.store, org, Platform::Google, "Attio CRM", 8, Some((Severity::High, 70.0))).await;

        let auth = bearer(&app, org, UserRole::Admin);
        let (status, body) =
            get_json(&app, "/api/automations?groupBy=vendor", Some(&auth)).await;
        assert_eq!(status, StatusCode::OK);

        let groups = body["vendorGroups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group["vendorName"], "Attio");
        assert_eq!(group["platform"], "google");
        assert_eq!(group["applicationCount"], 2);
        assert_eq!(group["highestRiskLevel"], "high");
        let mut scope_counts: Vec<u64> = group["applications"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["scopeCount"].as_u64().unwrap())
            .collect();
        scope_counts.sort_unstable();
        assert_eq!(scope_counts, vec![3, 8]);
    }

    #[tokio::test]
    async fn automation_list_is_org_scoped() {
        let app = test_app();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        seed_automation(&app.state.store, org_a, Platform::Slack, "mine", 1, None).await;
        seed_automation(&app.state.store, org_b, Platform::Slack, "theirs", 1, None).await;

        let auth = bearer(&app, org_a, UserRole::Viewer);
        let (_, body) = get_json(&app, "/api/automations", Some(&auth)).await;
        let automations = body["automations"].as_array().unwrap();
        assert_eq!(automations.len(), 1);
        assert_eq!(automations[0]["name"], "mine");
    }

    #[tokio::test]
    async fn cross_org_detail_reads_are_indistinguishable_from_missing() {
        let app = test_app();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let theirs =
            seed_automation(&app.state.store, org_b, Platform::Slack, "theirs", 1, None).await;

        let auth = bearer(&app, org_a, UserRole::Admin);
        let (status, body) =
            get_json(&app, &format!("/api/automations/{}", theirs.id), Some(&auth)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }

    #[tokio::test]
    async fn discovery_trigger_returns_202_then_409_while_running() {
        let app = test_app();
        let org = Uuid::new_v4();
        // A connected connection with an already-active run
        let conn = PlatformConnection {
            id: Uuid::new_v4(),
            organization_id: org,
            platform: Platform::Slack,
            platform_user_id: "u1".to_string(),
            display_name: None,
            status: ConnectionStatus::Connected,
            scopes: vec![],
            health: ConnectionHealth::default(),
            workspace: serde_json::json!({}),
            credentials_blocked: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        app.state.store.connections.insert(conn.clone()).await.unwrap();
        app.state
            .store
            .runs
            .insert(DiscoveryRun {
                id: Uuid::new_v4(),
                organization_id: org,
                connection_id: conn.id,
                status: RunStatus::Running,
                trigger: RunTrigger::Manual,
                started_at: Some(chrono::Utc::now()),
                completed_at: None,
                progress: RunProgress::default(),
                warnings: vec![],
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let auth = bearer(&app, org, UserRole::Admin);
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/discovery/{}", conn.id))
                    .method("POST")
                    .header("Authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Conflict");
        assert!(body["message"].as_str().unwrap().contains("already in progress"));
    }

    #[tokio::test]
    async fn feedback_submission_returns_201() {
        let app = test_app();
        let org = Uuid::new_v4();
        let automation =
            seed_automation(&app.state.store, org, Platform::Slack, "bot", 1, None).await;

        let auth = bearer(&app, org, UserRole::SecurityAnalyst);
        let payload = serde_json::json!({
            "automationId": automation.id,
            "feedbackType": "false_positive",
            "detectionSnapshot": {"patternType": "velocity"},
        });
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/feedback")
                    .method("POST")
                    .header("Authorization", &auth)
                    .header("Content-Type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let pending = app.state.store.feedback.list_pending(org).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].user_id, "test-user");
    }

    #[tokio::test]
    async fn analytics_routes_serve_zero_filled_shapes_for_empty_orgs() {
        let app = test_app();
        let org = Uuid::new_v4();
        let auth = bearer(&app, org, UserRole::Ciso);

        let (status, body) =
            get_json(&app, "/api/analytics/risk-trends?period=week", Some(&auth)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["labels"].as_array().unwrap().len(), 8);
        assert_eq!(body["averageRiskScore"].as_array().unwrap().len(), 8);

        let (status, body) =
            get_json(&app, "/api/analytics/risk-trends?period=quarter", Some(&auth)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["labels"].as_array().unwrap().len(), 91);

        let (status, _) = get_json(&app, "/api/analytics/heatmap", Some(&auth)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            get_json(&app, "/api/analytics/risk-trends?period=decade", Some(&auth)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationFailed");

        let (status, _) = get_json(&app, "/api/analytics/unknown-report", Some(&auth)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let app = test_app();
        let (status, body) = get_json(&app, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
