//! Error taxonomy shared across all Umbra services
//!
//! Variants map 1:1 onto the stable error tags exposed by the API envelope.
//! Messages never contain credential material.

use thiserror::Error;

/// Result type alias for Umbra operations
pub type Result<T> = std::result::Result<T, UmbraError>;

/// Core error taxonomy
#[derive(Error, Debug)]
pub enum UmbraError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Token invalid: {reason}")]
    TokenInvalid { reason: String },

    #[error("Organization mismatch")]
    OrgMismatch,

    #[error("Permission denied: {operation}")]
    PermissionDenied { operation: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Validation failed: {field}, reason: {reason}")]
    ValidationFailed { field: String, reason: String },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Upstream rate limited, retry after {retry_after_secs}s")]
    UpstreamRateLimited { retry_after_secs: u64 },

    #[error("Upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    #[error("Invalid grant: {reason}")]
    InvalidGrant { reason: String },

    #[error("Key unavailable: {reason}")]
    KeyUnavailable { reason: String },

    #[error("Decryption failure for connection {connection_id}")]
    DecryptionFailure { connection_id: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl UmbraError {
    /// Stable tag used in the API error envelope and in run warnings
    pub fn kind(&self) -> &'static str {
        match self {
            UmbraError::AuthRequired => "AuthRequired",
            UmbraError::TokenInvalid { .. } => "TokenInvalid",
            UmbraError::OrgMismatch => "OrgMismatch",
            UmbraError::PermissionDenied { .. } => "PermissionDenied",
            UmbraError::NotFound { .. } => "NotFound",
            UmbraError::ValidationFailed { .. } => "ValidationFailed",
            UmbraError::Conflict { .. } => "Conflict",
            UmbraError::RateLimited { .. } => "RateLimited",
            UmbraError::UpstreamRateLimited { .. } => "UpstreamRateLimited",
            UmbraError::UpstreamUnavailable { .. } => "UpstreamUnavailable",
            UmbraError::InvalidGrant { .. } => "InvalidGrant",
            UmbraError::KeyUnavailable { .. } => "KeyUnavailable",
            UmbraError::DecryptionFailure { .. } => "DecryptionFailure",
            UmbraError::Internal { .. } => "Internal",
        }
    }

    /// Shorthand for internal errors from displayable causes
    pub fn internal(reason: impl std::fmt::Display) -> Self {
        UmbraError::Internal {
            reason: reason.to_string(),
        }
    }

    /// Shorthand for missing resources
    pub fn not_found(resource: impl Into<String>) -> Self {
        UmbraError::NotFound {
            resource: resource.into(),
        }
    }

    /// True for errors worth retrying with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UmbraError::UpstreamRateLimited { .. } | UmbraError::UpstreamUnavailable { .. }
        )
    }
}

impl From<serde_json::Error> for UmbraError {
    fn from(err: serde_json::Error) -> Self {
        UmbraError::Internal {
            reason: format!("serialization: {err}"),
        }
    }
}

impl From<anyhow::Error> for UmbraError {
    fn from(err: anyhow::Error) -> Self {
        UmbraError::Internal {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_tags() {
        assert_eq!(UmbraError::AuthRequired.kind(), "AuthRequired");
        assert_eq!(
            UmbraError::Conflict {
                reason: "run in progress".into()
            }
            .kind(),
            "Conflict"
        );
        assert_eq!(
            UmbraError::UpstreamRateLimited { retry_after_secs: 30 }.kind(),
            "UpstreamRateLimited"
        );
    }

    #[test]
    fn retriable_classification() {
        assert!(UmbraError::UpstreamUnavailable {
            reason: "timeout".into()
        }
        .is_retriable());
        assert!(!UmbraError::InvalidGrant {
            reason: "revoked".into()
        }
        .is_retriable());
    }
}
