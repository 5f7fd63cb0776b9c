#![doc = include_str!("../README.md")]

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs, io,
    io::Write,
    path::Path,
};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};

use http::Method;
use log::{debug, info, warn};
use pouch_vault::{RequestOptions, Vault};
use tokio::time;
use tokio_util::sync::CancellationToken;

pub mod fs_watcher;
pub mod notifier;
pub mod pouchfile;
pub mod state;
pub mod systemd;
pub mod template;

use notifier::Reloader;
use pouchfile::{FileConfig, NotifierConfig, SecretConfig, DEFAULT_FILE_MODE};
use state::PouchState;
use systemd::StatusNotifier;

#[derive(Debug)]
pub enum Error {
    AmbiguousTemplate(String),
    Certificate(String),
    EmptySecretResponse(String),
    InvalidMethod(String),
    InvalidNotifier,
    Io(io::Error),
    MissingTemplate(String),
    NoReloader,
    NotifierCommand(std::process::ExitStatus, String),
    NotifierTimeout,
    Pouchfile(serde_yaml::Error),
    Reload(String, String),
    State(serde_json::Error),
    StatusNotification(String),
    TemplateSyntax(String),
    UnknownFunction(String),
    UnknownNotifier(String),
    UnknownSecret(String),
    UnknownSecretKey(String, String),
    Vault(pouch_vault::Error),
    Watch(notify::Error),
    WrongArgumentCount(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::State(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Pouchfile(e)
    }
}

impl From<pouch_vault::Error> for Error {
    fn from(e: pouch_vault::Error) -> Self {
        Self::Vault(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmbiguousTemplate(path) => {
                write!(f, "both template and template file set for '{path}'")
            }
            Self::Certificate(e) => f.write_str(e),
            Self::EmptySecretResponse(name) => {
                write!(f, "empty response for secret '{name}'")
            }
            Self::InvalidMethod(method) => write!(f, "invalid HTTP method '{method}'"),
            Self::InvalidNotifier => f.write_str("one and only one notifier option can be set"),
            Self::Io(e) => fmt::Display::fmt(e, f),
            Self::MissingTemplate(path) => {
                write!(f, "no template nor template file set for '{path}'")
            }
            Self::NoReloader => {
                f.write_str("service set for notifier, but no service reloader available")
            }
            Self::NotifierCommand(status, output) => {
                write!(f, "notifier command failed ({status}): {output}")
            }
            Self::NotifierTimeout => f.write_str("notifier timed out"),
            Self::Pouchfile(e) => write!(f, "couldn't load Pouchfile: {e}"),
            Self::Reload(service, output) => {
                write!(f, "couldn't reload '{service}': {output}")
            }
            Self::State(e) => write!(f, "couldn't decode state: {e}"),
            Self::StatusNotification(e) => write!(f, "couldn't notify status: {e}"),
            Self::TemplateSyntax(e) => write!(f, "template parse error: {e}"),
            Self::UnknownFunction(func) => write!(f, "unknown template function '{func}'"),
            Self::UnknownNotifier(name) => write!(f, "unknown notifier '{name}'"),
            Self::UnknownSecret(name) => write!(f, "unknown secret '{name}'"),
            Self::UnknownSecretKey(name, key) => {
                write!(f, "no key '{key}' in secret '{name}'")
            }
            Self::Vault(e) => fmt::Display::fmt(e, f),
            Self::Watch(e) => fmt::Display::fmt(e, f),
            Self::WrongArgumentCount(func) => {
                write!(f, "wrong number of arguments for '{func}'")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Pouchfile(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Vault(e) => Some(e),
            Self::Watch(e) => Some(e),
            _ => None,
        }
    }
}

/// Directory mode derived from a file mode: each permission triple that
/// grants anything also gets search (x), bits outside 0777 are stripped.
pub fn dir_mode(mode: u32) -> u32 {
    let mut mode = mode & 0o777;
    for shift in [0u32, 3, 6] {
        if mode & (0o7 << shift) != 0 {
            mode |= 0o1 << shift;
        }
    }
    mode
}

pub(crate) fn write_file(path: &Path, data: &[u8], _mode: u32) -> Result<(), Error> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(_mode);
    let mut f = options.open(path)?;
    f.write_all(data)?;
    Ok(())
}

/// The agent: composes the secret store client, the persistent state,
/// the renderer and the notifiers, and drives
/// login → resolve → notify → schedule.
pub struct Pouch<V> {
    vault: V,
    state: PouchState,
    secrets: BTreeMap<String, SecretConfig>,
    files: Vec<FileConfig>,
    notifiers: BTreeMap<String, NotifierConfig>,
    status_notifiers: Vec<Box<dyn StatusNotifier>>,
    reloader: Option<Box<dyn Reloader>>,
    pending_notifiers: BTreeSet<String>,
}

impl<V: Vault> Pouch<V> {
    pub fn new(
        state: PouchState,
        vault: V,
        secrets: BTreeMap<String, SecretConfig>,
        files: Vec<FileConfig>,
        notifiers: BTreeMap<String, NotifierConfig>,
    ) -> Self {
        Self {
            vault,
            state,
            secrets,
            files,
            notifiers,
            status_notifiers: Vec::new(),
            reloader: None,
            pending_notifiers: BTreeSet::new(),
        }
    }

    pub fn add_status_notifier(&mut self, notifier: Box<dyn StatusNotifier>) {
        self.status_notifiers.push(notifier);
    }

    pub fn set_reloader(&mut self, reloader: Box<dyn Reloader>) {
        self.reloader = Some(reloader);
    }

    pub fn state(&self) -> &PouchState {
        &self.state
    }

    /// Wait for a wrapped secret ID on `path` and unwrap it, so that the
    /// following `run` can log in. Returns cleanly on cancellation. An
    /// unwrap failure is final: wrapped tokens are single use.
    pub async fn watch<P: AsRef<Path>>(
        &mut self,
        path: P,
        shutdown: &CancellationToken,
    ) -> Result<(), Error> {
        let path = path.as_ref();

        if let Some(wrapped) = fs_watcher::read_wrapped(path).await? {
            self.vault.unwrap_secret_id(&wrapped).await?;
            return Ok(());
        }

        match fs_watcher::await_wrapped(path, shutdown).await? {
            Some(wrapped) => {
                self.notify_reload();
                self.vault.unwrap_secret_id(&wrapped).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Run the agent until cancelled: authenticate, bring all secrets
    /// and files up to date, report readiness, then keep refreshing
    /// whichever secret is due next.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), Error> {
        self.vault.login().await?;
        if let Some(token) = self.vault.get_token().await {
            self.state.token = token;
        }
        if let Err(e) = self.state.save() {
            warn!("Couldn't save state: {e}");
        }

        let configured: Vec<String> = self.secrets.keys().cloned().collect();
        for name in &configured {
            if !self.state.secrets.contains_key(name) {
                self.resolve_secret(name).await?;
            }
        }
        let stale: Vec<String> = self
            .state
            .secrets
            .keys()
            .filter(|name| !self.secrets.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            debug!("Removing secret '{name}' from state, not configured anymore");
            self.state.delete_secret(&name);
        }

        for fc in self.files.clone() {
            self.resolve_file(&fc)?;
        }

        self.notify_ready();

        loop {
            self.notify_pending().await;
            if let Err(e) = self.state.save() {
                warn!("Couldn't save state: {e}");
            }

            let due = self.state.next_update().map(|(secret, wait)| {
                let files_using: Vec<String> =
                    secret.files_using.iter().map(|f| f.path.clone()).collect();
                (secret.name.clone(), files_using, wait)
            });

            let Some((name, files_using, wait)) = due else {
                shutdown.cancelled().await;
                return Ok(());
            };

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = time::sleep(wait) => {
                    info!("Updating secret '{name}'");
                    self.resolve_secret(&name).await?;
                    for path in files_using {
                        let fc = self.files.iter().find(|f| f.path == path).cloned();
                        if let Some(fc) = fc {
                            self.resolve_file(&fc)?;
                        }
                    }
                }
            }
        }
    }

    /// Read one configured secret from the store and record the response
    /// in the state. String values of the request body are expanded
    /// first.
    async fn resolve_secret(&mut self, name: &str) -> Result<(), Error> {
        let config = self
            .secrets
            .get(name)
            .ok_or_else(|| Error::UnknownSecret(name.to_string()))?;

        let mut data = config.data.clone();
        for value in data.values_mut() {
            if let serde_json::Value::String(s) = value {
                *value = template::render_request_value(s)?.into();
            }
        }

        let method = match config.http_method.as_deref() {
            Some(method) => method
                .parse::<Method>()
                .map_err(|_| Error::InvalidMethod(method.to_string()))?,
            None => Method::GET,
        };

        let options = RequestOptions {
            wrap_ttl: None,
            data,
        };
        let secret = self
            .vault
            .request(method, &config.vault_url, Some(&options))
            .await?
            .ok_or_else(|| Error::EmptySecretResponse(name.to_string()))?;

        self.state.set_secret(name, &secret);
        Ok(())
    }

    /// Render one file from the state and write it with its configured
    /// mode, creating parent directories as needed. The mode is enforced
    /// even when the content is already up to date; notifiers are only
    /// enqueued when the content on disk actually changed.
    fn resolve_file(&mut self, fc: &FileConfig) -> Result<(), Error> {
        let content = self.render_file(fc)?;
        let mode = fc.mode.unwrap_or(DEFAULT_FILE_MODE);

        let path = Path::new(&fc.path);
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                builder.mode(dir_mode(mode));
                builder.create(dir)?;
            }
        }

        let changed = match fs::read(path) {
            Ok(existing) => existing != content.as_bytes(),
            Err(_) => true,
        };
        if changed {
            write_file(path, content.as_bytes(), mode)?;
            for name in &fc.notify {
                self.pending_notifiers.insert(name.clone());
            }
        }
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn render_file(&mut self, fc: &FileConfig) -> Result<String, Error> {
        let source = match (&fc.template, &fc.template_file) {
            (Some(template), None) => template.clone(),
            (None, Some(template_file)) => fs::read_to_string(template_file)?,
            (Some(_), Some(_)) => return Err(Error::AmbiguousTemplate(fc.path.clone())),
            (None, None) => return Err(Error::MissingTemplate(fc.path.clone())),
        };

        let template = template::parse(&source, &["secret"])?;

        let state = &mut self.state;
        template.render(|func, args| {
            // The parser only lets "secret" through
            debug_assert_eq!(func, "secret");
            let [secret_name, key] = args else {
                return Err(Error::WrongArgumentCount("secret".to_string()));
            };
            let secret = state
                .secrets
                .get_mut(secret_name)
                .ok_or_else(|| Error::UnknownSecret(secret_name.clone()))?;
            let rendered = match secret.data.get(key) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => {
                    return Err(Error::UnknownSecretKey(secret_name.clone(), key.clone()));
                }
            };
            secret.register_usage(&fc.path, fc.priority);
            Ok(rendered)
        })
    }

    /// Fire every notifier enqueued by the last round of file updates,
    /// once each.
    async fn notify_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending_notifiers);
        for name in pending {
            notifier::notify(&name, self.notifiers.get(&name), self.reloader.as_deref()).await;
        }
    }

    fn notify_ready(&self) {
        for notifier in &self.status_notifiers {
            if let Err(e) = notifier.notify_ready() {
                warn!("{e}");
            }
        }
    }

    fn notify_reload(&self) {
        for notifier in &self.status_notifiers {
            if let Err(e) = notifier.notify_reload() {
                warn!("{e}");
            }
        }
    }
}
