//! WebSocket upgrade endpoint.
//!
//! The token rides in `?token=` or `Authorization: Bearer`. Auth failures
//! still upgrade, then close immediately with a telling close code, so
//! clients can distinguish an expired token from a bad one.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::{jwt, Principal};
use crate::hub::connection::{self, Connection, MAX_FRAME_SIZE};
use crate::protocol::{ConnectedPayload, Envelope, MessageType};
use crate::state::AppState;

/// WebSocket close codes:
/// 4001 = token expired
/// 4002 = token invalid or missing
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

/// Presence TTL is five minutes; refresh comfortably inside it.
const PRESENCE_REFRESH_PERIOD: Duration = Duration::from_secs(240);

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET on the configured ws path. Authenticates, upgrades, and runs the
/// connection endpoint.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.token.or_else(|| bearer_token(&headers));

    let Some(token) = token else {
        tracing::warn!("websocket upgrade without a token");
        return close_after_upgrade(ws, CLOSE_TOKEN_INVALID, "Token missing");
    };

    match jwt::validate_token(state.jwt_secret.as_bytes(), &token) {
        Ok(claims) => {
            tracing::info!(user_id = %claims.sub, "websocket connection authenticated");
            ws.max_message_size(MAX_FRAME_SIZE)
                .on_upgrade(move |socket| handle_authenticated(socket, state, claims.into()))
        }
        Err(err) => {
            let (close_code, reason) = match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "Token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };
            tracing::warn!(close_code, reason, "websocket auth failed");
            close_after_upgrade(ws, close_code, reason)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn close_after_upgrade(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    })
}

async fn handle_authenticated(socket: WebSocket, state: AppState, principal: Principal) {
    let connection_id = Uuid::new_v4().to_string();
    let (conn, queue, shutdown) = Connection::new(connection_id, principal);

    state.hub.schedule_register(&conn);

    if let Some(presence) = &state.presence {
        if let Err(e) = presence.set_online(conn.user_id()).await {
            tracing::warn!(user_id = %conn.user_id(), error = %e, "failed to record presence");
        }
    }

    // First frame after registration.
    if let Ok(greeting) = Envelope::new(
        MessageType::Connected,
        ConnectedPayload {
            user_id: conn.user_id().to_string(),
            instance_id: state.instance_id.clone(),
        },
    ) {
        state.hub.send_to_connection(&conn, &greeting);
    }

    tracing::info!(
        client_id = %conn.id,
        user_id = %conn.user_id(),
        "websocket connection established"
    );

    // Keep the presence TTL alive for the connection's lifetime.
    let refresh = state.presence.clone().map(|presence| {
        let user_id = conn.user_id().to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRESENCE_REFRESH_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = presence.refresh(&user_id).await {
                    tracing::debug!(user_id = %user_id, error = %e, "presence refresh failed");
                }
            }
        })
    });

    connection::run(state.hub.clone(), conn.clone(), socket, queue, shutdown).await;

    if let Some(handle) = refresh {
        handle.abort();
    }

    // connection::run returns only after the hub applied the unregister, so
    // this count reflects the removal: clear this instance's presence entry
    // once the user's last local connection is gone.
    if let Some(presence) = &state.presence {
        if state.hub.user_connection_count(conn.user_id()) == 0 {
            if let Err(e) = presence.set_offline(conn.user_id()).await {
                tracing::warn!(user_id = %conn.user_id(), error = %e, "failed to clear presence");
            }
        }
    }
}
