//! TIAE Auth — bcrypt password hashing, credential generation, signed
//! envelope tokens for email links, and opaque session/refresh tokens.
//!
//! Everything here is pure: no database, no I/O. The session manager and
//! the login flows compose these primitives with the identity store.

pub mod config;
pub mod error;
pub mod password;
pub mod secret;
pub mod token;

pub use config::AuthConfig;
pub use error::AuthError;
pub use token::{EnvelopeClaims, EnvelopeError};
