use std::sync::Arc;

use crate::hub::Hub;
use crate::presence::PresenceManager;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Connection/room registry and dispatch entry points
    pub hub: Arc<Hub>,
    /// Advisory per-user liveness registry; absent when no shared store is
    /// attached (single-instance and test setups)
    pub presence: Option<PresenceManager>,
    /// HMAC secret for validating client JWTs
    pub jwt_secret: String,
    /// This process's id, stamped on cluster publications and the CONNECTED
    /// greeting
    pub instance_id: String,
    /// WebSocket endpoint path
    pub ws_path: String,
}
