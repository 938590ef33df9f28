//! Authentication interceptor for the public and admin RPC surfaces.
//!
//! Every request not on its surface's allowlist must carry a session
//! token: `sessionId` on the public surface, `Token` on the admin one. The
//! token is checked against the session store in a fresh context, and the
//! resolved [`AuthContext`] is attached to the request extensions for the
//! handler.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tiae_auth::token::parse_session_token;
use tiae_core::caller::{AuthContext, CallerMetadata, Principal, PrincipalKind};
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_db::store::{admin, session, user};
use tiae_db::{ConnectionRegistry, TxContext};
use tonic::codegen::http;
use tracing::{debug, info};
use uuid::Uuid;

use crate::status::to_status;

pub const PUBLIC_ALLOWLIST: &[&str] = &["Login", "SetPassword", "ValidateInvite"];

pub const ADMIN_ALLOWLIST: &[&str] = &[
    "Login",
    "SetPassword",
    "ValidateToken",
    "SetupDB",
    "SetupMigrate",
    "Setup",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Public,
    Admin,
}

impl Surface {
    /// Metadata key carrying the session token (lowercase on the wire).
    pub fn token_header(&self) -> &'static str {
        match self {
            Surface::Public => "sessionid",
            Surface::Admin => "token",
        }
    }

    pub fn allowlist(&self) -> &'static [&'static str] {
        match self {
            Surface::Public => PUBLIC_ALLOWLIST,
            Surface::Admin => ADMIN_ALLOWLIST,
        }
    }

    pub fn is_allowlisted(&self, method: &str) -> bool {
        self.allowlist().contains(&method)
    }
}

/// Method name of a gRPC path such as `/tiae.v1.Admin/Login`.
pub fn method_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// The identity behind a usable session, or `None`.
    async fn validate(&self, surface: Surface, session_id: Uuid) -> TiaeResult<Option<AuthContext>>;
}

fn rejected(reason: &str) -> TiaeError {
    TiaeError::Unauthenticated(reason.into())
}

/// Decide whether `method` may run. Allowlisted methods pass with no
/// identity; every other method needs a usable session.
pub async fn authenticate(
    validator: &dyn SessionValidator,
    surface: Surface,
    method: &str,
    metadata: &CallerMetadata,
) -> TiaeResult<Option<AuthContext>> {
    if surface.is_allowlisted(method) {
        debug!(?surface, method, "Allowlisted method");
        return Ok(None);
    }
    let Some(raw) = metadata.get(surface.token_header()) else {
        info!(?surface, method, "Rejected: no session token");
        return Err(rejected("missing session token"));
    };
    let Some(session_id) = parse_session_token(raw) else {
        info!(?surface, method, "Rejected: malformed session token");
        return Err(rejected("invalid or expired session"));
    };
    match validator.validate(surface, session_id).await? {
        Some(auth) => Ok(Some(auth)),
        None => {
            info!(?surface, method, "Rejected: session not usable");
            Err(rejected("invalid or expired session"))
        }
    }
}

/// Validates sessions against Postgres.
///
/// Each check runs in its own context so it observes every committed
/// login, and commits so that a lazily expired session stays expired.
pub struct DbSessionValidator {
    registry: Arc<ConnectionRegistry>,
}

impl DbSessionValidator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    async fn public_session(
        ctx: &mut TxContext,
        session_id: Uuid,
    ) -> TiaeResult<Option<AuthContext>> {
        let Some(found) = session::get_valid_session(ctx, session_id).await? else {
            return Ok(None);
        };
        let owner = user::get_user_by_id(ctx, found.user_id).await?;
        if !owner.enabled {
            return Ok(None);
        }
        let tenant = ctx.require_tenant()?;
        Ok(Some(AuthContext {
            session_id,
            principal: Principal {
                kind: PrincipalKind::User,
                id: owner.id,
                who_am_i: owner.email,
            },
            tenant_id: Some(tenant.id),
            tenant_short_name: Some(tenant.short_name.clone()),
        }))
    }

    async fn admin_session(
        ctx: &mut TxContext,
        session_id: Uuid,
    ) -> TiaeResult<Option<AuthContext>> {
        let Some(found) = session::get_valid_admin_session(ctx, session_id).await? else {
            return Ok(None);
        };
        let owner = admin::get_admin_by_id(ctx, found.admin_id).await?;
        Ok(Some(AuthContext {
            session_id,
            principal: Principal {
                kind: PrincipalKind::Admin,
                id: owner.id,
                who_am_i: owner.email,
            },
            tenant_id: None,
            tenant_short_name: None,
        }))
    }
}

#[async_trait]
impl SessionValidator for DbSessionValidator {
    async fn validate(&self, surface: Surface, session_id: Uuid) -> TiaeResult<Option<AuthContext>> {
        let mut ctx = TxContext::empty(self.registry.clone());
        let result = match surface {
            Surface::Public => Self::public_session(&mut ctx, session_id).await,
            Surface::Admin => Self::admin_session(&mut ctx, session_id).await,
        };
        match result {
            Ok(auth) => {
                ctx.commit().await?;
                Ok(auth)
            }
            Err(TiaeError::NotFound { .. }) => {
                ctx.rollback().await;
                Ok(None)
            }
            Err(err) => {
                ctx.rollback().await;
                Err(err)
            }
        }
    }
}

fn metadata_from_headers(headers: &http::HeaderMap) -> CallerMetadata {
    let mut metadata = CallerMetadata::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            metadata.insert(name.as_str(), value);
        }
    }
    metadata
}

/// Tower layer running [`authenticate`] in front of a gRPC service.
#[derive(Clone)]
pub struct AuthLayer {
    validator: Arc<dyn SessionValidator>,
    surface: Surface,
}

impl AuthLayer {
    pub fn new(validator: Arc<dyn SessionValidator>, surface: Surface) -> Self {
        Self { validator, surface }
    }
}

impl<S> tower::Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            validator: self.validator.clone(),
            surface: self.surface,
        }
    }
}

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    validator: Arc<dyn SessionValidator>,
    surface: Surface,
}

impl<S, ReqBody, ResBody> tower::Service<http::Request<ReqBody>> for AuthService<S>
where
    S: tower::Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the service that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let validator = self.validator.clone();
        let surface = self.surface;

        Box::pin(async move {
            let method = method_name(request.uri().path()).to_string();
            let metadata = metadata_from_headers(request.headers());
            match authenticate(validator.as_ref(), surface, &method, &metadata).await {
                Ok(Some(auth)) => {
                    request.extensions_mut().insert(auth);
                }
                Ok(None) => {}
                Err(err) => return Ok(to_status(&err).into_http()),
            }
            inner.call(request).await
        })
    }
}
