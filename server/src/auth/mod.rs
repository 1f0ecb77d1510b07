pub mod jwt;

pub use jwt::Claims;

/// Authenticated identity attached to a connection at upgrade time.
/// Immutable for the connection's lifetime.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub email: Option<String>,
    pub role: i64,
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
        }
    }
}
