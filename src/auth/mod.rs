//! Authentication module
//!
//! OAuth2 client-credentials against the identity domain fronting OIC.
//!
//! The `TokenManager` exchanges client credentials for bearer tokens,
//! caches them per credential set and refreshes them before they expire.

mod manager;
mod types;

pub use manager::{TokenManager, DEFAULT_REFRESH_MARGIN};
pub use types::{ClientCredentials, Token, TokenCacheKey, DEFAULT_SCOPE};
