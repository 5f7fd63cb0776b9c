use std::{
    collections::BTreeMap,
    env, fs,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use http::Method;
use pouch::{
    pouchfile::{FileConfig, SecretConfig},
    state::PouchState,
    Pouch,
};
use pouch_test::server;
use pouch_vault::{Config, VaultClient};
use tokio_util::sync::CancellationToken;

// Drives the agent end to end against an in-process secret store:
// AppRole login, initial materialization, and a TTL driven refresh.
#[tokio::test]
async fn agent_logs_in_materializes_and_refreshes() {
    static SECRET_READS: AtomicUsize = AtomicUsize::new(0);

    let server = server::http(move |req| async move {
        let body = match (req.method(), req.uri().path()) {
            (&Method::POST, "/v1/auth/approle/login") => {
                r#"
                {
                    "lease_duration": 0,
                    "renewable": false,
                    "auth": {
                      "client_token": "agent-token",
                      "lease_duration": 3600,
                      "renewable": true
                    }
                }
                "#
            }
            (&Method::GET, "/v1/auth/token/lookup-self") => {
                assert_eq!(req.headers()["X-Vault-Token"], "agent-token");
                r#"{"data":{"ttl":3600}}"#
            }
            (&Method::GET, "/v1/kv/app") => {
                assert_eq!(req.headers()["X-Vault-Token"], "agent-token");
                let _ = SECRET_READS.fetch_add(1, Ordering::Relaxed);
                r#"
                {
                    "lease_duration": 0,
                    "data": {"password": "hunter2", "ttl": 1}
                }
                "#
            }
            (method, path) => panic!("unexpected request {method} {path}"),
        };
        hyper::Response::new(body.into())
    });

    let dir = env::temp_dir().join("pouch-agent-e2e");
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();

    let shutdown = CancellationToken::new();
    let vault = VaultClient::new(
        Config {
            address: format!("http://{}", server.addr()),
            role_id: "app".to_string(),
            secret_id: "app-secret".to_string(),
            ..Default::default()
        },
        shutdown.clone(),
    )
    .unwrap();

    let secrets = BTreeMap::from([(
        "app".to_string(),
        SecretConfig {
            vault_url: "/v1/kv/app".to_string(),
            ..Default::default()
        },
    )]);
    let files = vec![FileConfig {
        path: dir.join("password").to_string_lossy().into_owned(),
        template: Some(r#"{{ secret "app" "password" }}"#.to_string()),
        ..Default::default()
    }];

    let state = PouchState::new(dir.join("state"));
    let mut pouch = Pouch::new(state, vault, secrets, files, BTreeMap::new());

    let canceller = shutdown.clone();
    let run = tokio::spawn(async move {
        let result = pouch.run(shutdown).await;
        (pouch, result)
    });

    // With a one second TTL and the default ratio the secret refreshes
    // every 750ms; leave room for a couple of rounds.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    canceller.cancel();
    let (pouch, result) = run.await.unwrap();
    result.unwrap();

    assert_eq!(fs::read_to_string(dir.join("password")).unwrap(), "hunter2");
    assert!(
        SECRET_READS.load(Ordering::Relaxed) >= 2,
        "the secret should have been refreshed at least once"
    );

    // The refresh carried the usage registration over
    let files_using: Vec<&str> = pouch.state().secrets["app"]
        .files_using
        .iter()
        .map(|f| f.path.as_str())
        .collect();
    assert_eq!(
        files_using,
        vec![dir.join("password").to_string_lossy().into_owned()]
    );

    let saved = PouchState::load(dir.join("state")).unwrap();
    assert_eq!(saved.token, "agent-token");
    assert!(!saved.secrets["app"].disable_auto_update);
}
