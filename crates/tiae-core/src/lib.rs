//! TIAE Core — domain models, error taxonomy and post-commit side effects
//! shared by every crate of the tenant control plane.

pub mod caller;
pub mod effects;
pub mod error;
pub mod models;
pub mod validation;

pub use caller::{AuthContext, CallerMetadata, Principal, PrincipalKind};
pub use effects::{EffectPhase, PostCommit};
pub use error::{ErrorKind, TiaeError, TiaeResult};
