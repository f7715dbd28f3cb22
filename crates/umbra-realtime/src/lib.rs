//! Umbra real-time hub
//!
//! Authenticated bidirectional channel between the server and dashboard
//! clients. The first client message carries a bearer token; the session is
//! bound to that token's organization and receives only events for it,
//! filtered by its role's subscription profile.

pub mod auth;
pub mod hub;
pub mod protocol;
pub mod socket;

pub use auth::{AuthContext, AuthError, Claims, TokenVerifier};
pub use hub::{Hub, HubStats};
pub use protocol::{role_topics, AuthErrorCode, ClientMessage, ControlMessage, Outbound};
pub use socket::serve_socket;
