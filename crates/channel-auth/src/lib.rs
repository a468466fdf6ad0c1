//! Channel credential primitives
//!
//! Holds the access/refresh credential pair of a channel, the redacting
//! `Secret` wrapper used to hand access tokens to remote operations, and the
//! OAuth refresh-token exchange. Nothing here knows about quotas or pools;
//! the pool crate decides *when* to refresh, this crate knows *how*.
//!
//! Refresh flow:
//! 1. Pool notices the access token is inside its renewal margin
//! 2. `TokenRefresher::refresh()` exchanges the refresh token at the token endpoint
//! 3. `Credential::renewed()` builds the new pair (keeping the old refresh
//!    token when the endpoint does not rotate it)
//! 4. Pool writes the new pair through to storage before using it

pub mod credential;
pub mod error;
pub mod secret;
pub mod token;

pub use credential::Credential;
pub use error::{Error, Result};
pub use secret::Secret;
pub use token::{OAuthRefresher, TokenRefresher, TokenResponse, refresh_token};
