//! The admin-gateway IAM client against a mock gateway.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tiae_core::models::service_account::ServiceAccountGrant;
use tiae_sync::adapters::{AdminClientProvider, HttpAdminProvider, ObjectStoreAdmin};
use tiae_sync::{AuthorizationSynchronizer, InMemoryDirectory};
use uuid::Uuid;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "gateway-token";

async fn admin(server: &MockServer) -> Arc<dyn ObjectStoreAdmin> {
    HttpAdminProvider::new(server.uri(), TOKEN, Duration::from_secs(2))
        .unwrap()
        .admin_client("acme")
        .await
        .unwrap()
}

#[tokio::test]
async fn users_are_created_with_their_secret() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/tenants/acme/users/AKIA0001"))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .and(body_json(json!({ "secretKey": "s3cr3t" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    admin(&server).await.add_user("AKIA0001", "s3cr3t").await.unwrap();
}

#[tokio::test]
async fn user_info_maps_missing_users_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tenants/acme/users/AKIA0001"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({
                "enabled": false,
                "policyName": "akia0001-0123456789abcdef"
            })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tenants/acme/users/GONE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let admin = admin(&server).await;
    let info = admin.get_user_info("AKIA0001").await.unwrap().unwrap();
    assert!(!info.enabled);
    assert_eq!(info.policy_name.as_deref(), Some("akia0001-0123456789abcdef"));
    assert_eq!(admin.get_user_info("GONE").await.unwrap(), None);
}

#[tokio::test]
async fn deleting_absent_objects_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;

    let admin = admin(&server).await;
    admin.remove_user("AKIA0001").await.unwrap();
    admin.remove_canned_policy("akia0001-0123456789abcdef").await.unwrap();
}

#[tokio::test]
async fn gateway_statuses_keep_their_retry_class() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/tenants/acme/users/BUSY/status"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tenants/acme/users/DENIED/status"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let admin = admin(&server).await;
    assert!(admin.set_user_status("BUSY", false).await.unwrap_err().is_transient());
    assert!(!admin.set_user_status("DENIED", false).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn tenant_names_cannot_escape_their_prefix() {
    let provider =
        HttpAdminProvider::new("http://127.0.0.1:9", TOKEN, Duration::from_secs(1)).unwrap();
    assert!(provider.admin_client("../admin").await.is_err());
    assert!(provider.admin_client("").await.is_err());
}

#[tokio::test]
async fn sync_disables_the_user_through_the_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tenants/acme/users/AKIA0001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "enabled": true })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tenants/acme/users/AKIA0001/status"))
        .and(body_json(json!({ "enabled": false })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let directory = Arc::new(InMemoryDirectory::new());
    let id = Uuid::new_v4();
    directory
        .put_grant(
            "acme",
            ServiceAccountGrant {
                service_account_id: id,
                access_key: "AKIA0001".into(),
                enabled: false,
                permissions: Vec::new(),
            },
        )
        .await;
    let provider =
        HttpAdminProvider::new(server.uri(), TOKEN, Duration::from_secs(2)).unwrap();
    let synchronizer = AuthorizationSynchronizer::new(Arc::new(provider), directory);

    let report = synchronizer.sync("acme", id).await.unwrap();
    assert_eq!(report.writes, 1);
}
