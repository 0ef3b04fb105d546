// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use mockito::Matcher;
use serde_json::json;
use stackpilot_core::domain::credentials::{CredentialError, CredentialsBackend};
use stackpilot_core::infrastructure::credentials::vault::VaultAuth;
use stackpilot_core::infrastructure::credentials::{VaultCredentials, VaultSettings};
use std::time::Duration;

fn settings(address: String, auth: VaultAuth) -> VaultSettings {
    VaultSettings {
        address,
        mount: "secret".into(),
        prefix: "acme".into(),
        environment: "prod".into(),
        auth,
    }
}

fn token_backend(server: &mockito::Server) -> VaultCredentials {
    VaultCredentials::new(settings(server.url(), VaultAuth::Token("root-token".into()))).unwrap()
}

#[tokio::test]
async fn test_read_write_through_kv_v2() {
    let mut server = mockito::Server::new_async().await;
    let read = server
        .mock("GET", "/v1/secret/data/acme/prod/db-password")
        .match_header("x-vault-token", "root-token")
        .with_status(200)
        .with_body(json!({ "data": { "data": { "value": "hunter2" } } }).to_string())
        .create_async()
        .await;
    let missing = server
        .mock("GET", "/v1/secret/data/acme/prod/api-key")
        .with_status(404)
        .create_async()
        .await;
    let write = server
        .mock("POST", "/v1/secret/data/acme/prod/api-key")
        .match_body(Matcher::Json(json!({ "data": { "value": "k" } })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let vault = token_backend(&server);
    assert_eq!(vault.get("db-password").await.unwrap().as_deref(), Some("hunter2"));
    assert_eq!(vault.get("api-key").await.unwrap(), None);
    vault.set("api-key", "k").await.unwrap();

    read.assert_async().await;
    missing.assert_async().await;
    write.assert_async().await;
}

#[tokio::test]
async fn test_set_if_absent_keeps_existing_value() {
    let mut server = mockito::Server::new_async().await;
    let _existing = server
        .mock("GET", "/v1/secret/data/acme/prod/db-password")
        .with_status(200)
        .with_body(json!({ "data": { "data": { "value": "v1" } } }).to_string())
        .create_async()
        .await;
    let write = server
        .mock("POST", "/v1/secret/data/acme/prod/db-password")
        .expect(0)
        .create_async()
        .await;

    let vault = token_backend(&server);
    assert!(!vault.set_if_absent("db-password", "v2").await.unwrap());
    write.assert_async().await;
}

#[tokio::test]
async fn test_path_like_names_never_reach_vault() {
    let mut server = mockito::Server::new_async().await;
    let any = server
        .mock("GET", Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let any_delete = server
        .mock("DELETE", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let vault = token_backend(&server);
    for name in ["../other/db-password", "team/db-password", ""] {
        assert!(matches!(
            vault.get(name).await,
            Err(CredentialError::InvalidName(_))
        ));
        assert!(matches!(
            vault.delete(name).await,
            Err(CredentialError::InvalidName(_))
        ));
    }
    any.assert_async().await;
    any_delete.assert_async().await;
}

#[tokio::test]
async fn test_list_and_delete() {
    let mut server = mockito::Server::new_async().await;
    let _list = server
        .mock("GET", "/v1/secret/metadata/acme/prod?list=true")
        .with_status(200)
        .with_body(json!({ "data": { "keys": ["zeta", "alpha", "nested/"] } }).to_string())
        .create_async()
        .await;
    let _read = server
        .mock("GET", "/v1/secret/data/acme/prod/alpha")
        .with_status(200)
        .with_body(json!({ "data": { "data": { "value": "a" } } }).to_string())
        .create_async()
        .await;
    let delete = server
        .mock("DELETE", "/v1/secret/metadata/acme/prod/alpha")
        .with_status(204)
        .create_async()
        .await;
    let _gone = server
        .mock("GET", "/v1/secret/data/acme/prod/ghost")
        .with_status(404)
        .create_async()
        .await;

    let vault = token_backend(&server);
    assert_eq!(vault.list().await.unwrap(), vec!["alpha", "zeta"]);
    assert!(vault.delete("alpha").await.unwrap());
    assert!(!vault.delete("ghost").await.unwrap());
    delete.assert_async().await;
}

#[tokio::test]
async fn test_approle_login_is_cached() {
    let mut server = mockito::Server::new_async().await;
    let login = server
        .mock("POST", "/v1/auth/approle/login")
        .match_body(Matcher::Json(json!({ "role_id": "role", "secret_id": "secret" })))
        .with_status(200)
        .with_body(
            json!({ "auth": { "client_token": "short-lived", "lease_duration": 3600 } })
                .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let read = server
        .mock("GET", "/v1/secret/data/acme/prod/db-password")
        .match_header("x-vault-token", "short-lived")
        .with_status(200)
        .with_body(json!({ "data": { "data": { "value": "x" } } }).to_string())
        .expect(2)
        .create_async()
        .await;

    let vault = VaultCredentials::new(settings(
        server.url(),
        VaultAuth::AppRole {
            role_id: "role".into(),
            secret_id: "secret".into(),
        },
    ))
    .unwrap();
    vault.get("db-password").await.unwrap();
    vault.get("db-password").await.unwrap();

    login.assert_async().await;
    read.assert_async().await;
}

#[tokio::test]
async fn test_server_errors_surface_as_backend_errors() {
    let mut server = mockito::Server::new_async().await;
    let _boom = server
        .mock("GET", "/v1/secret/data/acme/prod/db-password")
        .with_status(500)
        .with_body("internal")
        .create_async()
        .await;

    let vault = token_backend(&server);
    assert!(matches!(
        vault.get("db-password").await,
        Err(CredentialError::Backend(_))
    ));
}

#[tokio::test]
async fn test_readiness() {
    let mut server = mockito::Server::new_async().await;
    let sealed = server
        .mock("GET", "/v1/sys/health")
        .with_status(503)
        .create_async()
        .await;
    let vault = token_backend(&server);
    assert!(!vault.is_reachable().await);
    assert!(matches!(
        vault.wait_ready(Duration::from_millis(10)).await,
        Err(CredentialError::Unavailable(_))
    ));

    sealed.remove_async().await;
    let _standby = server
        .mock("GET", "/v1/sys/health")
        .with_status(429)
        .create_async()
        .await;
    assert!(vault.is_reachable().await);
}
