//! Tenant onboarding, login and session flows through the control plane.
//!
//! Run with a database: `DATABASE_URL=postgres://… cargo test -- --ignored`.

use std::sync::Arc;

use tiae_auth::AuthConfig;
use tiae_auth::password::verify_password;
use tiae_core::caller::{AuthContext, Principal, PrincipalKind};
use tiae_core::error::ErrorKind;
use tiae_core::models::permission::{ActionType, CreatePermission, Effect};
use tiae_core::models::service_account::CreateServiceAccount;
use tiae_core::models::tenant::CreateTenant;
use tiae_core::models::url_token::UrlTokenPurpose;
use tiae_db::store::{session, tenant, user};
use tiae_db::{ConnectionRegistry, DbConfig, TxContext};
use tiae_server::config::InviteConfig;
use tiae_server::{Call, ControlPlane, DbSessionValidator, SessionValidator, Surface};
use tiae_sync::adapters::{InMemoryObjectStore, InMemoryOrchestrator, RecordingEmailSender};
use tiae_sync::config::PROXY_CONFIG_MAP;
use tiae_sync::{
    AuthorizationSynchronizer, Dispatcher, EventBus, ProxySync, RegistryDirectory, SyncConfig,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    registry: Arc<ConnectionRegistry>,
    control: ControlPlane,
    store: Arc<InMemoryObjectStore>,
    email: Arc<RecordingEmailSender>,
}

async fn harness() -> Harness {
    let url = std::env::var("DATABASE_URL").unwrap();
    let registry = Arc::new(
        ConnectionRegistry::connect(DbConfig::for_url(&url).unwrap())
            .await
            .unwrap(),
    );
    let directory = Arc::new(RegistryDirectory::new(registry.clone()));
    let orchestrator = Arc::new(InMemoryOrchestrator::new());
    let store = Arc::new(InMemoryObjectStore::new());
    let email = Arc::new(RecordingEmailSender::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(AuthorizationSynchronizer::new(
            store.clone(),
            directory.clone(),
        )),
        Arc::new(ProxySync::new(
            orchestrator.clone(),
            directory.clone(),
            PROXY_CONFIG_MAP,
        )),
        orchestrator,
        email.clone(),
        directory,
        EventBus::new(16),
        SyncConfig::default(),
        CancellationToken::new(),
    ));
    let auth = AuthConfig {
        signing_secret: "integration-signing-secret-0123".into(),
        ..AuthConfig::default()
    };
    let control = ControlPlane::new(
        registry.clone(),
        auth,
        &InviteConfig {
            console_base_url: "https://console.example.test".into(),
        },
        dispatcher,
    )
    .with_inline_effects();
    control.setup_db().await.unwrap();
    Harness {
        registry,
        control,
        store,
        email,
    }
}

fn admin_call() -> Call {
    Call::authenticated(AuthContext {
        session_id: Uuid::new_v4(),
        principal: Principal {
            kind: PrincipalKind::Admin,
            id: Uuid::new_v4(),
            who_am_i: "root@console.test".into(),
        },
        tenant_id: None,
        tenant_short_name: None,
    })
}

fn unique_short_name() -> String {
    format!("acme{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Envelope carried by the last email sent to `to`.
async fn last_link_token(email: &RecordingEmailSender, to: &str) -> String {
    let sent = email.sent().await;
    let body = &sent
        .iter()
        .rev()
        .find(|m| m.to == to)
        .expect("no email for recipient")
        .body;
    let start = body.find("?token=").expect("no link in body") + "?token=".len();
    body[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

/// Helper: onboard a tenant and redeem the first user's signup link.
async fn onboarded(h: &Harness, short: &str) -> String {
    h.control
        .add_tenant(
            &admin_call(),
            CreateTenant {
                name: "Acme Inc".into(),
                short_name: short.into(),
                first_user_name: "Ada".into(),
                first_user_email: "ada@acme.test".into(),
                cost_per_gb: None,
            },
        )
        .await
        .unwrap();
    let envelope = last_link_token(&h.email, "ada@acme.test").await;
    h.control
        .complete_signup(&Call::anonymous(), &envelope, "s3cret!")
        .await
        .unwrap();
    envelope
}

async fn session_call(h: &Harness, session_id: Uuid) -> Option<Call> {
    DbSessionValidator::new(h.registry.clone())
        .validate(Surface::Public, session_id)
        .await
        .unwrap()
        .map(Call::authenticated)
}

#[tokio::test]
#[ignore]
async fn add_tenant_invites_a_disabled_first_user() {
    let h = harness().await;
    let short = unique_short_name();
    let (created, first) = h
        .control
        .add_tenant(
            &admin_call(),
            CreateTenant {
                name: "Acme Inc".into(),
                short_name: short.clone(),
                first_user_name: "Ada".into(),
                first_user_email: "ada@acme.test".into(),
                cost_per_gb: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(created.short_name, short);
    assert!(!first.enabled);
    assert!(first.password_hash.is_none());

    let sent = h.email.sent().await;
    let invite = sent.iter().find(|m| m.to == "ada@acme.test").unwrap();
    assert!(invite.body.contains("https://console.example.test/signup?token="));

    let info = h
        .control
        .validate_invite(&Call::anonymous(), &last_link_token(&h.email, "ada@acme.test").await)
        .await
        .unwrap();
    assert_eq!(info.purpose, UrlTokenPurpose::Signup);
    assert_eq!(info.company, "Acme Inc");

    let err = h
        .control
        .login(&Call::anonymous(), &short, "ada@acme.test", "anything")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);
}

#[tokio::test]
#[ignore]
async fn signup_link_activates_once() {
    let h = harness().await;
    let short = unique_short_name();
    let envelope = onboarded(&h, &short).await;

    let mut ctx = TxContext::empty(h.registry.clone());
    tenant::attach(&mut ctx, &short).await.unwrap();
    let ada = user::get_user_by_email(&mut ctx, "ada@acme.test").await.unwrap();
    ctx.rollback().await;
    assert!(ada.enabled);
    assert!(verify_password("s3cret!", ada.password_hash.as_deref().unwrap()).unwrap());

    let err = h
        .control
        .complete_signup(&Call::anonymous(), &envelope, "an0ther!")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyConsumed);

    let issued = h
        .control
        .login(&Call::anonymous(), &short, "ada@acme.test", "s3cret!")
        .await
        .unwrap();
    assert!(session_call(&h, issued.session_id).await.is_some());
}

#[tokio::test]
#[ignore]
async fn disabling_a_user_ends_every_session() {
    let h = harness().await;
    let short = unique_short_name();
    onboarded(&h, &short).await;

    let first = h
        .control
        .login(&Call::anonymous(), &short, "ada@acme.test", "s3cret!")
        .await
        .unwrap();
    let second = h
        .control
        .login(&Call::anonymous(), &short, "ada@acme.test", "s3cret!")
        .await
        .unwrap();
    let caller = session_call(&h, first.session_id).await.unwrap();
    let ada = caller.auth.as_ref().unwrap().principal.id;

    h.control
        .set_user_enabled(&admin_call(), &short, ada, false)
        .await
        .unwrap();

    for id in [first.session_id, second.session_id] {
        assert!(session_call(&h, id).await.is_none());
        let mut ctx = TxContext::empty(h.registry.clone());
        assert!(session::get_valid_session(&mut ctx, id).await.unwrap().is_none());
        ctx.rollback().await;
    }

    let err = h
        .control
        .login(&Call::anonymous(), &short, "ada@acme.test", "s3cret!")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);
}

#[tokio::test]
#[ignore]
async fn login_failures_are_indistinguishable() {
    let h = harness().await;
    let short = unique_short_name();
    onboarded(&h, &short).await;

    let wrong_password = h
        .control
        .login(&Call::anonymous(), &short, "ada@acme.test", "wrong")
        .await
        .unwrap_err();
    let no_tenant = h
        .control
        .login(&Call::anonymous(), "nope", "x", "y")
        .await
        .unwrap_err();
    let no_user = h
        .control
        .login(&Call::anonymous(), &short, "bob@acme.test", "y")
        .await
        .unwrap_err();

    assert_eq!(wrong_password.to_string(), no_tenant.to_string());
    assert_eq!(wrong_password.to_string(), no_user.to_string());
    assert_eq!(no_tenant.kind(), ErrorKind::Unauthenticated);
}

#[tokio::test]
#[ignore]
async fn change_password_replaces_the_session() {
    let h = harness().await;
    let short = unique_short_name();
    onboarded(&h, &short).await;

    let old = h
        .control
        .login(&Call::anonymous(), &short, "ada@acme.test", "s3cret!")
        .await
        .unwrap();
    let caller = session_call(&h, old.session_id).await.unwrap();

    let err = h
        .control
        .change_password(&caller, "wrong", "n3w-pass")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);

    let fresh = h
        .control
        .change_password(&caller, "s3cret!", "n3w-pass")
        .await
        .unwrap();
    assert!(session_call(&h, old.session_id).await.is_none());
    assert!(session_call(&h, fresh.session_id).await.is_some());

    h.control
        .login(&Call::anonymous(), &short, "ada@acme.test", "n3w-pass")
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn users_cannot_reach_other_tenants() {
    let h = harness().await;
    let ours = unique_short_name();
    let theirs = unique_short_name();
    onboarded(&h, &ours).await;
    onboarded(&h, &theirs).await;

    let issued = h
        .control
        .login(&Call::anonymous(), &ours, "ada@acme.test", "s3cret!")
        .await
        .unwrap();
    let caller = session_call(&h, issued.session_id).await.unwrap();

    assert_eq!(h.control.list_users(&caller, &ours).await.unwrap().len(), 1);
    let err = h.control.list_users(&caller, &theirs).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
#[ignore]
async fn invited_admin_sets_a_password_and_logs_in() {
    let h = harness().await;
    let email = format!("ops-{}@console.test", &Uuid::new_v4().simple().to_string()[..8]);
    h.control
        .invite_admin(&admin_call(), "Ops", &email)
        .await
        .unwrap();

    let envelope = last_link_token(&h.email, &email).await;
    // Admin links are not tenant links.
    let err = h
        .control
        .validate_invite(&Call::anonymous(), &envelope)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidToken);
    let info = h
        .control
        .validate_token(&Call::anonymous(), &envelope)
        .await
        .unwrap();
    assert_eq!(info.email, email);

    h.control
        .set_admin_password(&Call::anonymous(), &envelope, "adm1n-pass")
        .await
        .unwrap();
    let issued = h
        .control
        .admin_login(&Call::anonymous(), &email, "adm1n-pass")
        .await
        .unwrap();
    let auth = DbSessionValidator::new(h.registry.clone())
        .validate(Surface::Admin, issued.session_id)
        .await
        .unwrap()
        .unwrap();
    assert!(auth.is_admin());

    // A user-surface lookup never resolves an admin session.
    assert!(session_call(&h, issued.session_id).await.is_none());
}

#[tokio::test]
#[ignore]
async fn granted_permission_reaches_iam_after_commit() {
    let h = harness().await;
    let short = unique_short_name();
    onboarded(&h, &short).await;
    let admin = admin_call();

    let rw_logs = h
        .control
        .add_permission(
            &admin,
            &short,
            CreatePermission {
                name: "rw-logs".into(),
                description: None,
                effect: Effect::Allow,
                resources: vec!["logs".into()],
                actions: vec![ActionType::ReadWrite],
            },
        )
        .await
        .unwrap();
    let (account, credential) = h
        .control
        .add_service_account(
            &admin,
            &short,
            CreateServiceAccount {
                name: "logs-writer".into(),
                slug: Some("logs-writer".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(credential.access_key.len(), 16);

    h.control
        .assign_permissions_to_sa(&admin, &short, account.id, &[rw_logs.id])
        .await
        .unwrap();
    let iam = h.store.tenant(&short);
    let document = iam.attached_document(&credential.access_key).await.unwrap();
    assert!(document.contains("arn:aws:s3:::logs"));
    assert!(document.contains("arn:aws:s3:::logs/*"));
    assert!(document.contains("s3:PutObject"));

    let rotated = h
        .control
        .rotate_service_account_secret(&admin, &short, account.id)
        .await
        .unwrap();
    assert_ne!(rotated.secret_key, credential.secret_key);
    assert_eq!(
        iam.user_secret(&credential.access_key).await.as_deref(),
        Some(rotated.secret_key.as_str())
    );
}
