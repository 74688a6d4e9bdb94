//! Authentication module for Shipmail

pub mod api_key;
pub mod jwt;
pub mod middleware;

pub use api_key::ApiKeyManager;
pub use jwt::{Claims, JwtManager};
pub use middleware::{
    require_api_key, require_auth, require_cron, AuthError, AuthMethod, AuthState, AuthUser,
};
