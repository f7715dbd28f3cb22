//! Umbra API gateway
//!
//! Stateless REST handlers over the discovery, analytics, and realtime
//! services. Every handler authenticates the bearer token and scopes all
//! reads and writes to the token's organization.

pub mod error;
pub mod grouping;
pub mod handlers;
pub mod server;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;
use umbra_analytics::AnalyticsService;
use umbra_core::{UmbraConfig, UmbraError};
use umbra_discovery::{ConnectionManager, DiscoveryEngine};
use umbra_realtime::{AuthContext, Hub, TokenVerifier};
use umbra_store::Store;

use crate::error::ApiError;

/// Shared handler state; cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub engine: Arc<DiscoveryEngine>,
    pub manager: Arc<ConnectionManager>,
    pub analytics: AnalyticsService,
    pub hub: Arc<Hub>,
    pub verifier: TokenVerifier,
    pub cfg: Arc<UmbraConfig>,
}

/// Authenticated caller, extracted from the bearer token
pub struct AuthUser(pub AuthContext);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError(UmbraError::AuthRequired))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError(UmbraError::AuthRequired))?;
        let ctx = state.verifier.verify(token).map_err(|err| {
            ApiError(UmbraError::TokenInvalid {
                reason: err.to_string(),
            })
        })?;
        Ok(AuthUser(ctx))
    }
}
