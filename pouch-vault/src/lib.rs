#![doc = include_str!("../README.md")]

use std::{env, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use http::Method;
use log::{info, warn};
use metrics::increment_counter;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time};
use tokio_util::sync::CancellationToken;

pub const TOKEN_HEADER: &str = "X-Vault-Token";
pub const WRAP_TTL_HEADER: &str = "X-Vault-Wrap-Ttl";

pub const TOKEN_CREATE_URL: &str = "/v1/auth/token/create";
pub const SELF_TOKEN_URL: &str = "/v1/auth/token/lookup-self";
pub const SELF_TOKEN_RENEW_URL: &str = "/v1/auth/token/renew-self";

pub const SYS_HEALTH_URL: &str = "/v1/sys/health";

pub const AUTH_APPROLE_URL: &str = "/v1/sys/auth/approle";
pub const APPROLE_LOGIN_URL: &str = "/v1/auth/approle/login";
pub const APPROLE_URL: &str = "/v1/auth/approle/role";

pub const UNWRAP_URL: &str = "/v1/sys/wrapping/unwrap";

pub const ADDRESS_ENV: &str = "VAULT_ADDR";
pub const TOKEN_ENV: &str = "VAULT_TOKEN";
pub const CA_CERT_ENV: &str = "VAULT_CACERT";
pub const SKIP_VERIFY_ENV: &str = "VAULT_SKIP_VERIFY";
pub const DEFAULT_ADDRESS: &str = "https://127.0.0.1:8200";

/// Token renewal is scheduled at this portion of the token's TTL.
const AUTO_RENEW_PERIOD_RATIO: f64 = 0.5;
/// How long to wait before retrying a transiently failed token operation.
const TOKEN_RETRY_PERIOD: Duration = Duration::from_secs(5);

const LOGIN_LABEL: &str = "role_id";

/// Connection and credential configuration for the secret store, as it
/// appears in the agent's configuration document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub address: String,
    #[serde(default, rename = "roleID")]
    pub role_id: String,
    #[serde(default, rename = "secretID")]
    pub secret_id: String,
    #[serde(default)]
    pub token: String,
}

/// Secret data as returned by the store: a JSON object keyed by string.
pub type SecretData = serde_json::Map<String, serde_json::Value>;

/// The response envelope returned by most of the secret store's endpoints.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub lease_duration: i64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub data: Option<SecretData>,
    #[serde(default)]
    pub auth: Option<SecretAuth>,
    #[serde(default)]
    pub wrap_info: Option<WrapInfo>,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// The authentication block of a login or token operation response.
#[derive(Clone, Debug, Deserialize)]
pub struct SecretAuth {
    pub client_token: String,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub lease_duration: i64,
}

/// Wrapping information returned when a response has been wrapped.
#[derive(Clone, Debug, Deserialize)]
pub struct WrapInfo {
    pub token: String,
    #[serde(default)]
    pub ttl: i64,
}

/// Per-request options: an optional wrap TTL and a JSON request body.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub wrap_ttl: Option<String>,
    pub data: SecretData,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug)]
pub enum Error {
    Address(url::ParseError),
    CaCertificate(std::io::Error),
    Http(reqwest::Error),
    MissingAuth,
    MissingSecretId,
    MissingTokenTtl,
    NoResponse,
    RoleIdRequired,
    SecretIdNotString,
    /// The server replied with a non-success status. Carries the status
    /// and the messages from the error response body, joined.
    Status(StatusCode, String),
}

impl Error {
    /// The HTTP status of a [`Error::Status`] reply, if that is what
    /// this error is.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status(status, _) => Some(*status),
            _ => None,
        }
    }

    /// Whether the server rejected our credential outright. The renew
    /// loop uses this to distinguish a dead token from a flaky server.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self.status(),
            Some(StatusCode::BAD_REQUEST) | Some(StatusCode::FORBIDDEN)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(e) => write!(f, "invalid secret store address: {e}"),
            Self::CaCertificate(e) => write!(f, "couldn't read CA certificate: {e}"),
            Self::Http(e) => fmt::Display::fmt(e, f),
            Self::MissingAuth => f.write_str("no auth data found in response"),
            Self::MissingSecretId => f.write_str("no secret ID found in response"),
            Self::MissingTokenTtl => f.write_str("couldn't obtain token TTL"),
            Self::NoResponse => f.write_str("empty response from server"),
            Self::RoleIdRequired => f.write_str("role ID needed"),
            Self::SecretIdNotString => f.write_str("secret_id in response is not a string"),
            Self::Status(status, errors) if errors.is_empty() => {
                write!(f, "{status}")
            }
            Self::Status(status, errors) => write!(f, "{status} ({errors})"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Address(e) => Some(e),
            Self::CaCertificate(e) => Some(e),
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

/// The client interface the agent consumes. Modelled on the store's HTTP
/// API but open to other implementations, in particular test doubles.
#[async_trait]
pub trait Vault: Clone + Send + Sync {
    /// Authenticate against the store. If a token is already held, only
    /// the background renewal is started.
    async fn login(&self) -> Result<(), Error>;

    /// Perform an authenticated request against the given URL path. A
    /// 204 reply yields `None`.
    async fn request(
        &self,
        method: Method,
        url_path: &str,
        options: Option<&RequestOptions>,
    ) -> Result<Option<Secret>, Error>;

    /// Unwrap a single-use wrapped secret ID, authenticating with the
    /// wrapped token itself, and retain the contained secret ID for the
    /// next login.
    async fn unwrap_secret_id(&self, token: &str) -> Result<(), Error>;

    /// The client token currently held, if any.
    async fn get_token(&self) -> Option<String>;
}

/// A secret store client over the Hashicorp Vault HTTP API.
///
/// Cheap to clone; clones share the HTTP connection pool, the client
/// token and the retained secret ID.
#[derive(Clone)]
pub struct VaultClient {
    address: Url,
    client: Client,
    role_id: Option<String>,
    secret_id: Arc<Mutex<Option<String>>>,
    token: Arc<Mutex<Option<String>>>,
    shutdown: CancellationToken,
}

impl VaultClient {
    /// Establish a new client. The address is taken from the config when
    /// set, falling back to `VAULT_ADDR` and then the conventional local
    /// address; an empty config token falls back to `VAULT_TOKEN`. TLS
    /// trust honors `VAULT_CACERT` and `VAULT_SKIP_VERIFY`. The shutdown
    /// token terminates the background renewal task.
    pub fn new(config: Config, shutdown: CancellationToken) -> Result<Self, Error> {
        let address = if !config.address.is_empty() {
            config.address
        } else {
            env::var(ADDRESS_ENV).unwrap_or_else(|_| DEFAULT_ADDRESS.to_string())
        };
        let address = Url::parse(&address).map_err(Error::Address)?;

        let token = if !config.token.is_empty() {
            Some(config.token)
        } else {
            env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
        };

        let mut builder = Client::builder();
        if let Some(path) = env::var(CA_CERT_ENV).ok().filter(|p| !p.is_empty()) {
            let pem = std::fs::read(path).map_err(Error::CaCertificate)?;
            let certificate = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(certificate);
        }
        if env::var(SKIP_VERIFY_ENV).map_or(false, |v| truthy(&v)) {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        Ok(Self {
            address,
            client,
            role_id: Some(config.role_id).filter(|r| !r.is_empty()),
            secret_id: Arc::new(Mutex::new(
                Some(config.secret_id).filter(|s| !s.is_empty()),
            )),
            token: Arc::new(Mutex::new(token)),
            shutdown,
        })
    }

    async fn request_with_token(
        &self,
        method: Method,
        url_path: &str,
        options: Option<&RequestOptions>,
        token: Option<&str>,
    ) -> Result<Option<Secret>, Error> {
        let url = self.address.join(url_path).map_err(Error::Address)?;

        let mut builder = self.client.request(method, url);
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        if let Some(options) = options {
            if !options.data.is_empty() {
                builder = builder.json(&options.data);
            }
            if let Some(wrap_ttl) = options.wrap_ttl.as_deref() {
                builder = builder.header(WRAP_TTL_HEADER, wrap_ttl);
            }
        }

        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(response.json::<Secret>().await?));
        }

        increment_counter!("vault_request_failures");
        let errors = match response.json::<ErrorResponse>().await {
            Ok(error_response) => error_response.errors.join(", "),
            Err(_) => String::new(),
        };
        Err(Error::Status(status, errors))
    }

    /// How long until the held token expires, in seconds. A zero TTL
    /// means the token has no expiry.
    async fn token_ttl(&self) -> Result<i64, Error> {
        let secret = self
            .request(Method::GET, SELF_TOKEN_URL, None)
            .await?
            .ok_or(Error::MissingTokenTtl)?;
        secret
            .data
            .as_ref()
            .and_then(|d| d.get("ttl"))
            .and_then(|ttl| ttl.as_i64())
            .ok_or(Error::MissingTokenTtl)
    }

    /// Renew the held token against the server, reporting whether it can
    /// be renewed again.
    async fn renew_token(&self) -> Result<bool, Error> {
        increment_counter!("vault_token_renewals");
        let secret = self.request(Method::POST, SELF_TOKEN_RENEW_URL, None).await?;
        match secret {
            Some(Secret {
                auth: Some(auth), ..
            }) => Ok(auth.renewable),
            Some(secret) => Ok(secret.renewable),
            None => Ok(true),
        }
    }

    /// The token renewal state machine. Looks up the token TTL, sleeps
    /// half of it, renews, and starts over. Terminates when the server
    /// says the token is invalid or not renewable, when the token has no
    /// expiry, or on shutdown.
    async fn auto_renew_token(&self) {
        enum RenewState {
            UpdateTtl,
            Renew,
        }

        let mut state = RenewState::UpdateTtl;
        let mut next = Duration::ZERO;

        loop {
            match state {
                RenewState::UpdateTtl => match self.token_ttl().await {
                    Err(e) if e.is_auth_rejection() => {
                        increment_counter!("vault_invalid_tokens");
                        warn!("Invalid token");
                        return;
                    }
                    Err(e) => {
                        warn!("Couldn't obtain token TTL: {e}");
                        next = TOKEN_RETRY_PERIOD;
                    }
                    Ok(0) => {
                        info!("Using token without expiration");
                        return;
                    }
                    Ok(ttl) => {
                        state = RenewState::Renew;
                        next = Duration::from_secs_f64(ttl as f64 * AUTO_RENEW_PERIOD_RATIO);
                        info!(
                            "Next token renewal in {}",
                            humantime::format_duration(Duration::from_secs(next.as_secs()))
                        );
                    }
                },
                RenewState::Renew => {
                    info!("Renewing token");
                    match self.renew_token().await {
                        Err(e) if e.is_auth_rejection() => {
                            warn!("Token cannot be renewed anymore");
                            return;
                        }
                        Err(e) => {
                            warn!("Couldn't renew token: {e}");
                            next = TOKEN_RETRY_PERIOD;
                        }
                        Ok(false) => {
                            warn!("Token cannot be renewed anymore");
                            return;
                        }
                        Ok(true) => {
                            state = RenewState::UpdateTtl;
                            next = Duration::ZERO;
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = time::sleep(next) => (),
            }
        }
    }

    fn spawn_auto_renew(&self) {
        let client = self.clone();
        tokio::spawn(async move { client.auto_renew_token().await });
    }
}

fn truthy(value: &str) -> bool {
    !matches!(value.to_ascii_lowercase().as_str(), "" | "0" | "false" | "f" | "no")
}

#[async_trait]
impl Vault for VaultClient {
    async fn login(&self) -> Result<(), Error> {
        if self.token.lock().await.is_some() {
            self.spawn_auto_renew();
            return Ok(());
        }

        let role_id = self.role_id.as_deref().ok_or(Error::RoleIdRequired)?;
        increment_counter!("vault_login_requests", LOGIN_LABEL => role_id.to_string());

        let mut data = SecretData::new();
        data.insert("role_id".to_string(), role_id.into());
        if let Some(secret_id) = self.secret_id.lock().await.as_deref() {
            data.insert("secret_id".to_string(), secret_id.into());
        }
        let options = RequestOptions {
            data,
            ..Default::default()
        };

        let secret = self
            .request(Method::POST, APPROLE_LOGIN_URL, Some(&options))
            .await?
            .ok_or(Error::MissingAuth)?;
        let auth = secret.auth.ok_or(Error::MissingAuth)?;

        *self.token.lock().await = Some(auth.client_token);
        self.spawn_auto_renew();

        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        url_path: &str,
        options: Option<&RequestOptions>,
    ) -> Result<Option<Secret>, Error> {
        let token = self.token.lock().await.clone();
        self.request_with_token(method, url_path, options, token.as_deref())
            .await
    }

    async fn unwrap_secret_id(&self, token: &str) -> Result<(), Error> {
        increment_counter!("vault_unwrap_requests");
        let secret = self
            .request_with_token(Method::POST, UNWRAP_URL, None, Some(token))
            .await?
            .ok_or(Error::NoResponse)?;
        let secret_id = secret
            .data
            .as_ref()
            .and_then(|d| d.get("secret_id"))
            .ok_or(Error::MissingSecretId)?;
        let secret_id = secret_id.as_str().ok_or(Error::SecretIdNotString)?;
        *self.secret_id.lock().await = Some(secret_id.to_string());
        Ok(())
    }

    async fn get_token(&self) -> Option<String> {
        self.token.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pouch_test::server;
    use test_log::test;

    use super::*;

    fn test_client(addr: std::net::SocketAddr, token: Option<&str>) -> VaultClient {
        VaultClient {
            address: Url::parse(&format!("http://{}:{}", addr.ip(), addr.port())).unwrap(),
            client: Client::new(),
            role_id: None,
            secret_id: Arc::new(Mutex::new(None)),
            token: Arc::new(Mutex::new(token.map(|t| t.to_string()))),
            shutdown: CancellationToken::new(),
        }
    }

    #[test(tokio::test)]
    async fn token_ttl_from_lookup_self() {
        let server = server::http(move |req| async move {
            assert_eq!(req.uri().path(), SELF_TOKEN_URL);
            assert_eq!(req.headers()[TOKEN_HEADER], "some-token");
            hyper::Response::new(r#"{"data":{"ttl":768,"renewable":true}}"#.into())
        });

        let client = test_client(server.addr(), Some("some-token"));
        assert_eq!(client.token_ttl().await.unwrap(), 768);
    }

    #[test(tokio::test)]
    async fn renew_token_reports_renewable_from_auth() {
        let server = server::http(move |req| async move {
            assert_eq!(req.uri().path(), SELF_TOKEN_RENEW_URL);
            hyper::Response::new(
                r#"{"auth":{"client_token":"some-token","renewable":false,"lease_duration":0}}"#
                    .into(),
            )
        });

        let client = test_client(server.addr(), Some("some-token"));
        assert!(!client.renew_token().await.unwrap());
    }

    #[test(tokio::test)]
    async fn auto_renew_stops_when_token_cannot_be_renewed() {
        static RENEW_REQUESTS: AtomicUsize = AtomicUsize::new(0);

        let server = server::http(move |req| async move {
            match req.uri().path() {
                SELF_TOKEN_URL => {
                    hyper::Response::new(r#"{"data":{"ttl":1,"renewable":true}}"#.into())
                }
                SELF_TOKEN_RENEW_URL => {
                    let _ = RENEW_REQUESTS.fetch_add(1, Ordering::Relaxed);
                    let mut response = hyper::Response::new(
                        r#"{"errors":["token not renewable"]}"#.into(),
                    );
                    *response.status_mut() = hyper::StatusCode::BAD_REQUEST;
                    response
                }
                _ => panic!("unexpected uri"),
            }
        });

        let client = test_client(server.addr(), Some("some-token"));
        client.auto_renew_token().await;

        // The loop renewed once, was told 400, and terminated. The token
        // is still available for further requests.
        assert_eq!(RENEW_REQUESTS.load(Ordering::Relaxed), 1);
        assert_eq!(client.get_token().await.as_deref(), Some("some-token"));
    }

    #[test(tokio::test)]
    async fn auto_renew_stops_on_token_without_expiry() {
        let server = server::http(move |req| async move {
            assert_eq!(req.uri().path(), SELF_TOKEN_URL);
            hyper::Response::new(r#"{"data":{"ttl":0}}"#.into())
        });

        let client = test_client(server.addr(), Some("some-token"));
        // Terminates rather than looping forever.
        client.auto_renew_token().await;
    }

    #[test]
    fn skip_verify_values() {
        for value in ["1", "true", "TRUE", "t", "yes"] {
            assert!(truthy(value), "{value} should enable skipping");
        }
        for value in ["", "0", "false", "False", "no"] {
            assert!(!truthy(value), "{value} should not enable skipping");
        }
    }

    #[test(tokio::test)]
    async fn auto_renew_stops_on_invalid_token() {
        let server = server::http(move |req| async move {
            assert_eq!(req.uri().path(), SELF_TOKEN_URL);
            let mut response =
                hyper::Response::new(r#"{"errors":["permission denied"]}"#.into());
            *response.status_mut() = hyper::StatusCode::FORBIDDEN;
            response
        });

        let client = test_client(server.addr(), Some("expired"));
        client.auto_renew_token().await;
    }
}
