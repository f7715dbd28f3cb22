//! REST handlers
//!
//! Thin translations between HTTP and the services. Organization scoping is
//! enforced here: every lookup goes through the caller's token org, so a
//! resource from another tenant is indistinguishable from a missing one.

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use umbra_analytics::Period;
use umbra_core::types::*;
use umbra_core::UmbraError;
use umbra_realtime::serve_socket;
use umbra_store::AutomationFilter;
use uuid::Uuid;

use crate::error::ApiError;
use crate::grouping::{automation_view, group_by_vendor};
use crate::{AppState, AuthUser};

type ApiResult<T> = Result<T, ApiError>;

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 200;

fn parse_platform(raw: &str) -> ApiResult<Platform> {
    Platform::parse(raw).ok_or_else(|| {
        ApiError(UmbraError::ValidationFailed {
            field: "platform".to_string(),
            reason: format!("unknown platform {raw:?}"),
        })
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Health & realtime
// ═══════════════════════════════════════════════════════════════════════════

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.hub.stats();
    Json(json!({
        "status": "ok",
        "realtimeSessions": stats.sessions,
    }))
}

pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    let verifier = state.verifier.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub, verifier))
}

// ═══════════════════════════════════════════════════════════════════════════
// Connections & OAuth
// ═══════════════════════════════════════════════════════════════════════════

pub async fn list_connections(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let connections = state
        .store
        .connections
        .list_for_org(ctx.organization_id)
        .await?;
    Ok(Json(json!({ "connections": connections })))
}

pub async fn begin_oauth(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(platform): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let platform = parse_platform(&platform)?;
    let (url, oauth_state) = state
        .manager
        .begin_authorization(ctx.organization_id, platform)
        .await?;
    Ok(Json(json!({ "url": url, "state": oauth_state })))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// OAuth redirect target; identity comes from the signed state, not a
/// bearer header
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(params): Query<CallbackParams>,
) -> ApiResult<Response> {
    parse_platform(&platform)?;
    let connection = state
        .manager
        .complete_authorization(&params.state, &params.code)
        .await?;
    let location = format!("/connections?connected={}", connection.platform);
    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, location)],
    )
        .into_response())
}

pub async fn disconnect_connection(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(connection_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .disconnect(ctx.organization_id, connection_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ═══════════════════════════════════════════════════════════════════════════
// Discovery
// ═══════════════════════════════════════════════════════════════════════════

pub async fn trigger_discovery(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(connection_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<DiscoveryRun>)> {
    let run = state
        .engine
        .clone()
        .trigger_run(ctx.organization_id, connection_id, RunTrigger::Manual)
        .await?;
    state
        .store
        .audit
        .append(AuditLogEntry {
            id: Uuid::new_v4(),
            organization_id: ctx.organization_id,
            event_type: AuditEventType::DiscoveryTriggered,
            severity: Severity::Low,
            actor: ctx.user_id.clone(),
            resource: format!("connection:{connection_id}"),
            details: json!({"runId": run.id}),
            created_at: Utc::now(),
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

pub async fn get_run(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<DiscoveryRun>> {
    let run = state
        .store
        .runs
        .get(ctx.organization_id, run_id)
        .await?
        .ok_or_else(|| ApiError(UmbraError::not_found(format!("run {run_id}"))))?;
    Ok(Json(run))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(run_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    // Scope check before touching engine state
    state
        .store
        .runs
        .get(ctx.organization_id, run_id)
        .await?
        .ok_or_else(|| ApiError(UmbraError::not_found(format!("run {run_id}"))))?;
    state.engine.cancel_run(run_id)?;
    Ok(StatusCode::ACCEPTED)
}

// ═══════════════════════════════════════════════════════════════════════════
// Automations
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutomationListParams {
    pub group_by: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub platform: Option<String>,
    pub include_inactive: Option<bool>,
}

pub async fn list_automations(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Query(params): Query<AutomationListParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let grouped = match params.group_by.as_deref() {
        None => false,
        Some("vendor") => true,
        Some(other) => {
            return Err(ApiError(UmbraError::ValidationFailed {
                field: "groupBy".to_string(),
                reason: format!("unsupported value {other:?}"),
            }))
        }
    };
    let platform = params
        .platform
        .as_deref()
        .map(parse_platform)
        .transpose()?;

    let page = params.page.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let filter = AutomationFilter {
        platform,
        include_inactive: params.include_inactive.unwrap_or(false),
        discovered_after: None,
        page,
        limit,
    };
    let automations = state
        .store
        .automations
        .list(ctx.organization_id, &filter)
        .await?;
    let risks = state.store.risks.current_for_org(ctx.organization_id).await?;
    let views: Vec<_> = automations
        .into_iter()
        .map(|a| {
            let risk = risks.get(&a.id);
            automation_view(a, risk)
        })
        .collect();

    if grouped {
        Ok(Json(json!({ "vendorGroups": group_by_vendor(views) })))
    } else {
        Ok(Json(json!({
            "automations": views,
            "page": page,
            "limit": limit,
        })))
    }
}

pub async fn automation_detail(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(automation_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let automation = state
        .store
        .automations
        .get(ctx.organization_id, automation_id)
        .await?
        .ok_or_else(|| ApiError(UmbraError::not_found(format!("automation {automation_id}"))))?;
    let risk = state
        .store
        .risks
        .current_for_automation(ctx.organization_id, automation_id)
        .await?;
    let detections = state
        .store
        .detections
        .list_for_automation(ctx.organization_id, automation_id, 20)
        .await?;
    let view = automation_view(automation, risk.as_ref());
    Ok(Json(json!({
        "automation": view,
        "currentRisk": risk,
        "recentDetections": detections,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorOverrideBody {
    pub vendor_name: Option<String>,
}

/// Maintenance operation: operators may override the heuristic vendor name
pub async fn override_vendor(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(automation_id): Path<Uuid>,
    Json(body): Json<VendorOverrideBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let updated = state
        .store
        .automations
        .override_vendor(ctx.organization_id, automation_id, body.vendor_name.clone())
        .await?;
    state
        .store
        .audit
        .append(AuditLogEntry {
            id: Uuid::new_v4(),
            organization_id: ctx.organization_id,
            event_type: AuditEventType::VendorOverridden,
            severity: Severity::Low,
            actor: ctx.user_id.clone(),
            resource: format!("automation:{automation_id}"),
            details: json!({"vendorName": body.vendor_name}),
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(json!({ "automation": automation_view(updated, None) })))
}

// ═══════════════════════════════════════════════════════════════════════════
// Feedback
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackBody {
    pub automation_id: Uuid,
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub detection_snapshot: serde_json::Value,
    pub correction: Option<String>,
    #[serde(default)]
    pub features: Vec<f64>,
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Json(body): Json<FeedbackBody>,
) -> ApiResult<(StatusCode, Json<AutomationFeedback>)> {
    // The referenced automation must belong to the caller's organization
    state
        .store
        .automations
        .get(ctx.organization_id, body.automation_id)
        .await?
        .ok_or_else(|| {
            ApiError(UmbraError::not_found(format!(
                "automation {}",
                body.automation_id
            )))
        })?;

    let feedback = AutomationFeedback {
        id: Uuid::new_v4(),
        organization_id: ctx.organization_id,
        automation_id: body.automation_id,
        user_id: ctx.user_id.clone(),
        feedback_type: body.feedback_type,
        detection_snapshot: body.detection_snapshot,
        correction: body.correction,
        features: body.features,
        status: FeedbackStatus::Pending,
        created_at: Utc::now(),
    };
    state.store.feedback.insert(feedback.clone()).await?;
    state
        .store
        .audit
        .append(AuditLogEntry {
            id: Uuid::new_v4(),
            organization_id: ctx.organization_id,
            event_type: AuditEventType::FeedbackSubmitted,
            severity: Severity::Low,
            actor: ctx.user_id,
            resource: format!("automation:{}", body.automation_id),
            details: json!({"feedbackType": body.feedback_type}),
            created_at: Utc::now(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(feedback)))
}

// ═══════════════════════════════════════════════════════════════════════════
// Analytics
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsParams {
    pub period: Option<String>,
    pub include_inactive: Option<bool>,
    pub limit: Option<usize>,
}

pub async fn analytics_report(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(report): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let period = match params.period.as_deref() {
        None => Period::Week,
        Some(raw) => Period::parse(raw).ok_or_else(|| {
            ApiError(UmbraError::ValidationFailed {
                field: "period".to_string(),
                reason: format!("unknown period {raw:?}"),
            })
        })?,
    };
    let include_inactive = params.include_inactive.unwrap_or(false);
    let org = ctx.organization_id;

    let body = match report.as_str() {
        "risk-trends" => serde_json::to_value(
            state
                .analytics
                .risk_trends(org, period, include_inactive)
                .await?,
        ),
        "platform-distribution" => serde_json::to_value(
            state
                .analytics
                .platform_distribution(org, include_inactive)
                .await?,
        ),
        "automation-growth" => serde_json::to_value(
            state
                .analytics
                .automation_growth(org, period, include_inactive)
                .await?,
        ),
        "top-risks" => serde_json::to_value(
            state
                .analytics
                .top_risks(org, params.limit.unwrap_or(10))
                .await?,
        ),
        "summary" => {
            serde_json::to_value(state.analytics.summary(org, period, include_inactive).await?)
        }
        "heatmap" => serde_json::to_value(state.analytics.heatmap(org, include_inactive).await?),
        "type-distribution" => serde_json::to_value(
            state
                .analytics
                .type_distribution(org, include_inactive)
                .await?,
        ),
        other => {
            return Err(ApiError(UmbraError::not_found(format!(
                "analytics report {other:?}"
            ))))
        }
    };
    Ok(Json(body.map_err(UmbraError::from)?))
}
