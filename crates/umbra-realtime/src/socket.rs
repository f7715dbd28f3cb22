//! WebSocket session loop
//!
//! Drives one upgraded socket: first-message authentication, outbound pump,
//! and inbound control handling. Auth failures answer with a typed error
//! and close the connection.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::TokenVerifier;
use crate::hub::Hub;
use crate::protocol::{AuthErrorCode, ClientMessage, ControlMessage, Outbound};

/// How long a client may take to send its authenticate message
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

fn control_text(msg: &ControlMessage) -> String {
    serde_json::to_string(msg).unwrap_or_default()
}

/// Serve one upgraded socket until either side closes
pub async fn serve_socket(socket: WebSocket, hub: Arc<Hub>, verifier: TokenVerifier) {
    let (mut sender, mut receiver) = socket.split();

    // First message must authenticate
    let first = tokio::time::timeout(AUTH_DEADLINE, receiver.next()).await;
    let auth_msg = match first {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<ClientMessage>(&text).ok(),
        _ => None,
    };

    let (token, requested_org) = match auth_msg {
        Some(ClientMessage::Authenticate {
            token,
            organization_id,
        }) => (token, organization_id),
        _ => {
            let _ = sender
                .send(Message::Text(control_text(&ControlMessage::AuthenticationError {
                    code: AuthErrorCode::TokenMissing,
                    message: "first message must authenticate".to_string(),
                })))
                .await;
            let _ = sender.close().await;
            return;
        }
    };

    let Some(token) = token else {
        let _ = sender
            .send(Message::Text(control_text(&ControlMessage::AuthenticationError {
                code: AuthErrorCode::TokenMissing,
                message: "bearer token missing".to_string(),
            })))
            .await;
        let _ = sender.close().await;
        return;
    };

    let ctx = match verifier.verify(&token) {
        Ok(ctx) => ctx,
        Err(err) => {
            warn!(error = %err, "websocket authentication failed");
            let _ = sender
                .send(Message::Text(control_text(&ControlMessage::AuthenticationError {
                    code: AuthErrorCode::InvalidToken,
                    message: "token failed verification".to_string(),
                })))
                .await;
            let _ = sender.close().await;
            return;
        }
    };

    if let Some(requested) = requested_org {
        if requested != ctx.organization_id {
            let _ = sender
                .send(Message::Text(control_text(&ControlMessage::AuthenticationError {
                    code: AuthErrorCode::OrgMismatch,
                    message: "token is bound to a different organization".to_string(),
                })))
                .await;
            let _ = sender.close().await;
            return;
        }
    }

    let (session_id, subscriptions, mut rx) = hub.register(&ctx);
    let _ = sender
        .send(Message::Text(control_text(&ControlMessage::Authenticated {
            organization_id: ctx.organization_id,
            role: ctx.role,
            subscriptions,
        })))
        .await;

    // Outbound pump: hub queue -> socket. Ends when the session is
    // unregistered or reaped (the queue closes).
    let pump = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let text = outbound.to_json().to_string();
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Inbound loop: control messages and liveness
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                hub.touch(session_id);
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::UpdateSubscriptions { topics }) => {
                        if let Some(granted) = hub.update_subscriptions(session_id, &topics) {
                            hub.send_control(
                                session_id,
                                ControlMessage::SubscriptionsUpdated {
                                    subscriptions: granted,
                                },
                            );
                        }
                    }
                    Ok(ClientMessage::Ping) => {
                        hub.send_control(
                            session_id,
                            ControlMessage::Pong {
                                server_time: chrono::Utc::now().timestamp_millis() as u64,
                            },
                        );
                    }
                    Ok(ClientMessage::Authenticate { .. }) => {
                        debug!(session = %session_id, "re-authentication ignored");
                    }
                    Err(err) => {
                        debug!(session = %session_id, error = %err, "unparseable client message");
                    }
                }
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => hub.touch(session_id),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.unregister(session_id);
    pump.abort();
}

impl Hub {
    /// Queue a control message onto one session
    pub fn send_control(&self, session_id: uuid::Uuid, msg: ControlMessage) {
        self.try_send(session_id, Outbound::Control(msg));
    }
}
