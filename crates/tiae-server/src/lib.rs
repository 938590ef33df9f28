//! TIAE Server — the control-plane facade over the identity store, the
//! authentication interceptor for both RPC surfaces, and the login,
//! invite and administration flows.

pub mod config;
pub mod control;
pub mod handlers;
pub mod interceptor;
pub mod mailer;
pub mod status;

pub use config::{AppConfig, ConfigError, IdentityProviderConfig, InviteConfig};
pub use control::{Call, ControlPlane};
pub use handlers::InviteInfo;
pub use interceptor::{AuthLayer, DbSessionValidator, SessionValidator, Surface};
pub use status::to_status;
