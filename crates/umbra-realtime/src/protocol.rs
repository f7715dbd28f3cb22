//! Realtime wire protocol
//!
//! Client messages are tagged enums; server control messages likewise.
//! Published events go out as bare [`RealtimeEvent`] objects so the
//! dashboard sees `{type, organizationId, payload, ts}` at the top level.

use serde::{Deserialize, Serialize};
use umbra_core::events::{RealtimeEvent, Topic};
use umbra_core::types::UserRole;
use uuid::Uuid;

/// Messages from client → hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first message on the socket
    Authenticate {
        token: Option<String>,
        /// Optional explicit binding; must match the token's organization
        organization_id: Option<Uuid>,
    },
    /// Narrow the subscription set within the role's allowance
    UpdateSubscriptions { topics: Vec<Topic> },
    Ping,
}

/// Typed authentication failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthErrorCode {
    #[serde(rename = "TOKEN_MISSING")]
    TokenMissing,
    #[serde(rename = "INVALID_TOKEN")]
    InvalidToken,
    #[serde(rename = "ORG_MISMATCH")]
    OrgMismatch,
}

/// Control messages from hub → client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Authenticated {
        organization_id: Uuid,
        role: UserRole,
        subscriptions: Vec<Topic>,
    },
    AuthenticationError {
        code: AuthErrorCode,
        message: String,
    },
    SubscriptionsUpdated {
        subscriptions: Vec<Topic>,
    },
    Pong {
        server_time: u64,
    },
}

/// Anything the hub can put on a session's outbound queue
#[derive(Debug, Clone)]
pub enum Outbound {
    Control(ControlMessage),
    Event(RealtimeEvent),
}

impl Outbound {
    /// Wire form; events are not wrapped
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Outbound::Control(msg) => serde_json::to_value(msg).unwrap_or_default(),
            Outbound::Event(event) => serde_json::to_value(event).unwrap_or_default(),
        }
    }
}

/// Subscription profile a role is entitled to
pub fn role_topics(role: UserRole) -> Vec<Topic> {
    match role {
        UserRole::Ciso => vec![
            Topic::ChainDetection,
            Topic::RiskAlerts,
            Topic::ExecutiveUpdates,
        ],
        UserRole::SecurityAnalyst => vec![
            Topic::AnalysisProgress,
            Topic::ChainDetection,
            Topic::RiskAlerts,
            Topic::PerformanceMetrics,
        ],
        UserRole::Admin => vec![
            Topic::AnalysisProgress,
            Topic::ChainDetection,
            Topic::RiskAlerts,
            Topic::ExecutiveUpdates,
            Topic::PerformanceMetrics,
        ],
        UserRole::Viewer => vec![Topic::ChainDetection, Topic::RiskAlerts],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::events::EventKind;

    #[test]
    fn role_profiles_match_the_entitlement_table() {
        assert!(!role_topics(UserRole::Ciso).contains(&Topic::AnalysisProgress));
        assert!(role_topics(UserRole::Ciso).contains(&Topic::ExecutiveUpdates));
        assert!(role_topics(UserRole::SecurityAnalyst).contains(&Topic::PerformanceMetrics));
        assert!(!role_topics(UserRole::SecurityAnalyst).contains(&Topic::ExecutiveUpdates));
        assert_eq!(role_topics(UserRole::Admin).len(), 5);
        assert_eq!(
            role_topics(UserRole::Viewer),
            vec![Topic::ChainDetection, Topic::RiskAlerts]
        );
    }

    #[test]
    fn auth_error_codes_use_screaming_wire_names() {
        let json = serde_json::to_string(&ControlMessage::AuthenticationError {
            code: AuthErrorCode::OrgMismatch,
            message: "organization mismatch".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"ORG_MISMATCH\""));
        assert!(json.contains("\"authentication_error\""));
    }

    #[test]
    fn events_serialize_unwrapped() {
        let event = RealtimeEvent::new(
            EventKind::DiscoveryProgress,
            Uuid::new_v4(),
            serde_json::json!({"processed": 10}),
        );
        let json = Outbound::Event(event).to_json();
        assert_eq!(json["type"], "discovery.progress");
        assert!(json.get("organizationId").is_some());
        assert!(json.get("payload").is_some());
    }

    #[test]
    fn client_messages_parse_from_wire_form() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "authenticate", "token": "abc", "organization_id": null}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Authenticate { token: Some(_), .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "update_subscriptions", "topics": ["riskAlerts"]}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::UpdateSubscriptions { .. }));
    }
}
