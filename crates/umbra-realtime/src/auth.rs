//! Bearer-token verification
//!
//! Shared by the REST middleware and the realtime hub: HS256 signature,
//! expiry, and audience checks, with claims identifying the user, the
//! organization, and the dashboard role.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use umbra_core::types::UserRole;
use uuid::Uuid;

/// JWT claims carried by dashboard tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Organization the token is bound to
    pub org: Uuid,
    /// Dashboard role
    pub role: String,
    pub aud: String,
    pub exp: i64,
}

/// Verified identity extracted from a token
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub organization_id: Uuid,
    pub role: UserRole,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Invalid(String),
    #[error("unknown role: {0}")]
    UnknownRole(String),
}

/// Verifier over the shared server secret
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    audience: String,
}

impl TokenVerifier {
    pub fn new(secret: &str, audience: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            audience: audience.to_string(),
        }
    }

    /// Verify signature, expiry, and audience; map claims to an identity
    pub fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.audience.clone()]);
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        let role = UserRole::parse(&data.claims.role)
            .ok_or_else(|| AuthError::UnknownRole(data.claims.role.clone()))?;
        Ok(AuthContext {
            user_id: data.claims.sub,
            organization_id: data.claims.org,
            role,
        })
    }

    /// Issue a token; used by tests and the local dev login
    pub fn issue(
        &self,
        user_id: &str,
        organization_id: Uuid,
        role: UserRole,
        ttl_secs: i64,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.to_string(),
            org: organization_id,
            role: serde_json::to_value(role)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            aud: self.audience.clone(),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("unit-test-secret", "umbra")
    }

    #[test]
    fn issued_tokens_verify_with_identity_intact() {
        let verifier = verifier();
        let org = Uuid::new_v4();
        let token = verifier
            .issue("user-7", org, UserRole::SecurityAnalyst, 60)
            .unwrap();
        let ctx = verifier.verify(&token).unwrap();
        assert_eq!(ctx.user_id, "user-7");
        assert_eq!(ctx.organization_id, org);
        assert_eq!(ctx.role, UserRole::SecurityAnalyst);
    }

    #[test]
    fn wrong_secret_and_wrong_audience_are_rejected() {
        let token = verifier()
            .issue("u", Uuid::new_v4(), UserRole::Admin, 60)
            .unwrap();
        assert!(TokenVerifier::new("other-secret", "umbra").verify(&token).is_err());
        assert!(TokenVerifier::new("unit-test-secret", "other-aud")
            .verify(&token)
            .is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let verifier = verifier();
        let token = verifier
            .issue("u", Uuid::new_v4(), UserRole::Viewer, -120)
            .unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(verifier().verify("not.a.token").is_err());
    }
}
