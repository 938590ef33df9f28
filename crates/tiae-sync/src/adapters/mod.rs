//! Narrow interfaces over the systems the control plane drives after
//! commit, with in-memory implementations for tests and local runs.

pub mod email;
pub mod http_admin;
pub mod object_store;
pub mod orchestrator;

pub use email::{EmailSender, RecordingEmailSender, TracingEmailSender};
pub use http_admin::{HttpAdminProvider, HttpObjectStoreAdmin};
pub use object_store::{
    AdminClientProvider, IamOp, InMemoryObjectStore, ObjectStoreAdmin, TenantIam, UserInfo,
};
pub use orchestrator::{ConfigMap, InMemoryOrchestrator, KubeRestOrchestrator, Orchestrator};
