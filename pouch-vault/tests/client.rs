use std::{
    str,
    sync::atomic::{AtomicUsize, Ordering},
};

use http::Method;
use pouch_test::server;
use pouch_vault::*;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

fn config(addr: std::net::SocketAddr) -> Config {
    Config {
        address: format!("http://{}:{}", addr.ip(), addr.port()),
        ..Default::default()
    }
}

#[tokio::test]
async fn approle_login_with_secret_id() {
    static HTTP_REQUESTS: AtomicUsize = AtomicUsize::new(0);

    let server = server::http(move |mut req| async move {
        let _ = HTTP_REQUESTS.fetch_add(1, Ordering::Relaxed);
        let body = match (req.method(), req.uri().path()) {
            (&Method::POST, "/v1/auth/approle/login") => {
                assert!(req.headers().get("X-Vault-Token").is_none());

                let mut req_body: Vec<u8> = Vec::new();
                while let Some(item) = req.body_mut().next().await {
                    req_body.extend(&*item.unwrap());
                }
                assert_eq!(
                    str::from_utf8(&req_body),
                    Ok(r#"{"role_id":"test-role","secret_id":"test-secret"}"#)
                );

                r#"
                {
                    "lease_id": "",
                    "renewable": false,
                    "lease_duration": 0,
                    "data": null,
                    "wrap_info": null,
                    "warnings": null,
                    "auth": {
                      "client_token": "test-token",
                      "lease_duration": 2764800,
                      "renewable": true
                    }
                }
                "#
            }
            (&Method::GET, "/v1/foo") => {
                assert_eq!(req.headers()["X-Vault-Token"], "test-token");
                r#"
                {
                    "lease_id": "",
                    "renewable": false,
                    "lease_duration": 60,
                    "data": {"foo": "secretfoo"},
                    "wrap_info": null,
                    "warnings": null,
                    "auth": null
                }
                "#
            }
            // The background renewal looks the fresh token up
            (&Method::GET, "/v1/auth/token/lookup-self") => {
                assert_eq!(req.headers()["X-Vault-Token"], "test-token");
                r#"{"data":{"ttl":3600}}"#
            }
            _ => panic!("unexpected uri"),
        };
        hyper::Response::new(body.into())
    });

    let vault = VaultClient::new(
        Config {
            role_id: "test-role".to_string(),
            secret_id: "test-secret".to_string(),
            ..config(server.addr())
        },
        CancellationToken::new(),
    )
    .unwrap();

    vault.login().await.unwrap();
    assert_eq!(vault.get_token().await.as_deref(), Some("test-token"));

    let secret = vault
        .request(Method::GET, "/v1/foo", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(secret.lease_duration, 60);
    assert_eq!(
        secret.data.unwrap()["foo"],
        serde_json::Value::from("secretfoo")
    );

    // Login and one secret read; the renew task may have looked the
    // token up by now but never more than once before it sleeps.
    assert!(HTTP_REQUESTS.load(Ordering::Relaxed) >= 2);
}

#[tokio::test]
async fn login_requires_a_role_id() {
    let vault = VaultClient::new(
        Config {
            address: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .unwrap();

    assert!(matches!(vault.login().await, Err(Error::RoleIdRequired)));
}

#[tokio::test]
async fn login_with_existing_token_skips_the_server() {
    let vault = VaultClient::new(
        Config {
            address: "http://127.0.0.1:1".to_string(),
            token: "prior-token".to_string(),
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .unwrap();

    vault.login().await.unwrap();
    assert_eq!(vault.get_token().await.as_deref(), Some("prior-token"));
}

#[tokio::test]
async fn unwrap_retains_the_contained_secret_id() {
    let server = server::http(move |req| async move {
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path(), "/v1/sys/wrapping/unwrap");
        // The wrapped token itself is the credential
        assert_eq!(req.headers()["X-Vault-Token"], "wrapped-token");
        hyper::Response::new(r#"{"data":{"secret_id":"the-secret-id"}}"#.into())
    });

    let vault = VaultClient::new(config(server.addr()), CancellationToken::new()).unwrap();
    vault.unwrap_secret_id("wrapped-token").await.unwrap();
}

#[tokio::test]
async fn unwrap_without_secret_id_in_response_fails() {
    let server = server::http(move |_req| async move {
        hyper::Response::new(r#"{"data":{"something": "else"}}"#.into())
    });

    let vault = VaultClient::new(config(server.addr()), CancellationToken::new()).unwrap();
    assert!(matches!(
        vault.unwrap_secret_id("wrapped-token").await,
        Err(Error::MissingSecretId)
    ));
}

#[tokio::test]
async fn no_content_replies_yield_no_secret() {
    let server = server::http(move |_req| async move {
        let mut response = hyper::Response::new(hyper::Body::empty());
        *response.status_mut() = hyper::StatusCode::NO_CONTENT;
        response
    });

    let vault = VaultClient::new(config(server.addr()), CancellationToken::new()).unwrap();
    let secret = vault.request(Method::POST, "/v1/foo", None).await.unwrap();
    assert!(secret.is_none());
}

#[tokio::test]
async fn wrap_ttl_header_is_attached() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["X-Vault-Wrap-Ttl"], "60s");
        hyper::Response::new(r#"{"wrap_info":{"token":"wrapped-token","ttl":60}}"#.into())
    });

    let vault = VaultClient::new(config(server.addr()), CancellationToken::new()).unwrap();
    let options = RequestOptions {
        wrap_ttl: Some("60s".to_string()),
        ..Default::default()
    };
    let secret = vault
        .request(Method::POST, "/v1/auth/approle/role/test/secret-id", Some(&options))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(secret.wrap_info.unwrap().token, "wrapped-token");
}

#[tokio::test]
async fn error_statuses_carry_the_server_messages() {
    let server = server::http(move |_req| async move {
        let mut response =
            hyper::Response::new(r#"{"errors":["permission denied","try later"]}"#.into());
        *response.status_mut() = hyper::StatusCode::FORBIDDEN;
        response
    });

    let vault = VaultClient::new(config(server.addr()), CancellationToken::new()).unwrap();
    let err = vault.request(Method::GET, "/v1/foo", None).await.unwrap_err();
    assert_eq!(err.status(), Some(reqwest::StatusCode::FORBIDDEN));
    assert!(err.is_auth_rejection());
    assert!(err.to_string().contains("permission denied, try later"));
}
