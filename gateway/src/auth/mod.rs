//! Bearer-token authentication.

mod token;

pub use token::{bearer_token, AuthError, Identity, TokenVerifier};
