//! Post-commit synchronization for the tenant control plane.
//!
//! After a transactional context commits, the effects it staged are handed
//! to a [`Dispatcher`]. It projects service accounts and permissions onto
//! the object store's IAM, rewrites the reverse-proxy tenant map, stores
//! tenant credentials, and sends email. Failures are retried with backoff
//! and, once retries run out, reported as reconciliation events.

pub mod adapters;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod policy;
pub mod proxy;
pub mod retry;
pub mod synchronizer;

pub use config::{ObjectStoreConfig, SyncConfig};
pub use directory::{Directory, InMemoryDirectory, RegistryDirectory};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::AdapterError;
pub use events::{EventBus, IncidentSummary, ReconciliationNeeded, watch_incidents};
pub use policy::PolicyDocument;
pub use proxy::{ProxyOutcome, ProxySync};
pub use retry::{RetryError, RetryPolicy};
pub use synchronizer::{AuthorizationSynchronizer, SyncReport};
