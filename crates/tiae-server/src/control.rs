//! The control plane: one transactional context per call, committed or
//! rolled back exactly once, with staged side effects handed to the
//! dispatcher after a successful commit.
//!
//! Handlers are split across [`crate::handlers`]. Each public operation
//! opens a context with [`ControlPlane::begin`], runs its body against it
//! and closes it with [`ControlPlane::finish`].

use std::sync::Arc;

use tiae_auth::AuthConfig;
use tiae_core::caller::{AuthContext, CallerMetadata};
use tiae_core::effects::PostCommit;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::tenant::Tenant;
use tiae_db::store::tenant;
use tiae_db::{ConnectionRegistry, TxContext};
use tiae_sync::Dispatcher;
use tracing::debug;

use crate::config::InviteConfig;
use crate::mailer::Mailer;

/// One inbound RPC as the handlers see it.
#[derive(Debug, Clone, Default)]
pub struct Call {
    pub metadata: CallerMetadata,
    /// Set by the interceptor for non-allowlisted methods.
    pub auth: Option<AuthContext>,
}

impl Call {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(auth: AuthContext) -> Self {
        Self {
            auth: Some(auth),
            ..Self::default()
        }
    }

    /// Metadata and interceptor identity of a tonic request.
    pub fn from_request<T>(request: &tonic::Request<T>) -> Self {
        let mut metadata = CallerMetadata::new();
        for entry in request.metadata().iter() {
            if let tonic::metadata::KeyAndValueRef::Ascii(key, value) = entry {
                if let Ok(value) = value.to_str() {
                    metadata.insert(key.as_str(), value);
                }
            }
        }
        Self {
            metadata,
            auth: request.extensions().get::<AuthContext>().cloned(),
        }
    }

    pub fn require_auth(&self) -> TiaeResult<&AuthContext> {
        self.auth
            .as_ref()
            .ok_or_else(|| TiaeError::Unauthenticated("authentication required".into()))
    }

    pub fn require_admin(&self) -> TiaeResult<&AuthContext> {
        let auth = self.require_auth()?;
        if !auth.is_admin() {
            return Err(TiaeError::PermissionDenied("admin session required".into()));
        }
        Ok(auth)
    }
}

pub struct ControlPlane {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) auth: AuthConfig,
    pub(crate) mailer: Mailer,
    pub(crate) dispatcher: Arc<Dispatcher>,
    inline_effects: bool,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        auth: AuthConfig,
        invite: &InviteConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            registry,
            auth,
            mailer: Mailer::new(invite),
            dispatcher,
            inline_effects: false,
        }
    }

    /// Run post-commit effects before the call returns instead of in the
    /// background.
    pub fn with_inline_effects(mut self) -> Self {
        self.inline_effects = true;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn auth_config(&self) -> &AuthConfig {
        &self.auth
    }

    /// Open the context for `call`. It is cancelled when the process
    /// shuts down.
    pub fn begin(&self, call: &Call) -> TxContext {
        let ctx = match &call.auth {
            Some(auth) => {
                TxContext::for_caller(self.registry.clone(), call.metadata.clone(), auth.clone())
            }
            None => TxContext::with_caller(self.registry.clone(), call.metadata.clone()),
        };
        ctx.with_cancellation(self.dispatcher.shutdown_token().child_token())
    }

    /// Commit on success, roll back on failure, then hand committed
    /// effects to the dispatcher.
    pub async fn finish<T>(&self, mut ctx: TxContext, result: TiaeResult<T>) -> TiaeResult<T> {
        match result {
            Ok(value) => {
                let effects = ctx.commit().await?;
                self.dispatch(effects).await;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "Rolling back");
                ctx.rollback().await;
                Err(err)
            }
        }
    }

    pub(crate) async fn dispatch(&self, effects: Vec<PostCommit>) {
        if self.inline_effects {
            self.dispatcher.dispatch(effects).await;
        } else {
            self.dispatcher.spawn(effects);
        }
    }

    /// Attach `short_name` to `ctx` if the caller may act on it: admins on
    /// any tenant, users on their own.
    pub(crate) async fn scope_tenant(
        &self,
        ctx: &mut TxContext,
        call: &Call,
        short_name: &str,
    ) -> TiaeResult<Tenant> {
        let auth = call.require_auth()?;
        if !auth.is_admin() && auth.tenant_short_name.as_deref() != Some(short_name) {
            return Err(TiaeError::PermissionDenied(format!(
                "no access to tenant {short_name}"
            )));
        }
        tenant::attach(ctx, short_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use tiae_core::caller::{Principal, PrincipalKind};
    use tiae_core::error::ErrorKind;
    use tiae_db::DbConfig;
    use tiae_sync::adapters::{InMemoryObjectStore, InMemoryOrchestrator, RecordingEmailSender};
    use tiae_sync::{
        AuthorizationSynchronizer, EventBus, InMemoryDirectory, ProxySync, SyncConfig,
    };
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn control_plane(shutdown: CancellationToken) -> ControlPlane {
        let config = DbConfig::default();
        let pool = PgPoolOptions::new().connect_lazy_with(config.provisioning_options().unwrap());
        let registry = Arc::new(ConnectionRegistry::with_pool(config, pool));
        let directory = Arc::new(InMemoryDirectory::new());
        let orchestrator = Arc::new(InMemoryOrchestrator::new());
        let dispatcher = Dispatcher::new(
            Arc::new(AuthorizationSynchronizer::new(
                Arc::new(InMemoryObjectStore::new()),
                directory.clone(),
            )),
            Arc::new(ProxySync::new(
                orchestrator.clone(),
                directory.clone(),
                "nginx-configuration",
            )),
            orchestrator,
            Arc::new(RecordingEmailSender::new()),
            directory,
            EventBus::new(4),
            SyncConfig::default(),
            shutdown,
        );
        ControlPlane::new(
            registry,
            AuthConfig::default(),
            &InviteConfig::default(),
            Arc::new(dispatcher),
        )
    }

    fn user_auth() -> AuthContext {
        AuthContext {
            session_id: Uuid::new_v4(),
            principal: Principal {
                kind: PrincipalKind::User,
                id: Uuid::new_v4(),
                who_am_i: "ada@acme.test".into(),
            },
            tenant_id: Some(Uuid::new_v4()),
            tenant_short_name: Some("acme".into()),
        }
    }

    #[test]
    fn anonymous_calls_are_unauthenticated() {
        let err = Call::anonymous().require_auth().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[test]
    fn users_are_not_admins() {
        let call = Call::authenticated(user_auth());
        assert!(call.require_auth().is_ok());
        assert_eq!(
            call.require_admin().unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn request_metadata_and_identity_are_carried() {
        let auth = user_auth();
        let mut request = tonic::Request::new(());
        request
            .metadata_mut()
            .insert("sessionid", auth.session_id.to_string().parse().unwrap());
        request.extensions_mut().insert(auth.clone());

        let call = Call::from_request(&request);
        assert_eq!(call.auth, Some(auth.clone()));
        assert_eq!(
            call.metadata.get("sessionId"),
            Some(auth.session_id.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_open_contexts() {
        let shutdown = CancellationToken::new();
        let control = control_plane(shutdown.clone());
        let mut ctx = control.begin(&Call::authenticated(user_auth()));
        assert!(!ctx.cancellation_token().is_cancelled());

        shutdown.cancel();
        assert!(ctx.cancellation_token().is_cancelled());
        // Refused before any connection is acquired.
        assert!(ctx.main_tx().await.is_err());
    }
}
