//! The agent's YAML configuration document: where the secret store
//! lives, which secrets to fetch, which files to render from them, and
//! who to tell when those files change.

use std::{collections::BTreeMap, fs, path::Path};

use serde::Deserialize;

use crate::{state::SecretData, Error};

pub const DEFAULT_POUCHFILE_PATH: &str = "Pouchfile";

pub const DEFAULT_FILE_MODE: u32 = 0o600;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pouchfile {
    /// Path watched for a one-time wrapped secret ID dropped by an
    /// operator.
    #[serde(default, rename = "wrappedSecretIDPath")]
    pub wrapped_secret_id_path: Option<String>,

    /// Where the agent persists its state between runs.
    #[serde(default, rename = "statePath")]
    pub state_path: Option<String>,

    #[serde(default)]
    pub vault: pouch_vault::Config,

    #[serde(default)]
    pub systemd: SystemdConfig,

    /// Secrets to keep fresh, by name.
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretConfig>,

    /// Files rendered from the secrets, in order.
    #[serde(default)]
    pub files: Vec<FileConfig>,

    /// Notifiers that files may trigger, by name.
    #[serde(default)]
    pub notifiers: BTreeMap<String, NotifierConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemdConfig {
    /// Whether to integrate with systemd. Defaults to integrating when
    /// systemd is available.
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretConfig {
    /// Path on the secret store this secret is read from.
    #[serde(default, rename = "vaultURL")]
    pub vault_url: String,

    /// HTTP method for the request. Defaults to GET.
    #[serde(default, rename = "httpMethod")]
    pub http_method: Option<String>,

    /// Request body. String values may use the `env` and `hostname`
    /// template functions.
    #[serde(default)]
    pub data: SecretData,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub path: String,

    /// File mode for the rendered file. Defaults to 0600.
    #[serde(default)]
    pub mode: Option<u32>,

    /// Inline template text. Mutually exclusive with `templateFile`.
    #[serde(default)]
    pub template: Option<String>,

    /// Path to a template file. Mutually exclusive with `template`.
    #[serde(default, rename = "templateFile")]
    pub template_file: Option<String>,

    /// Ordering hint recorded with usage registrations.
    #[serde(default)]
    pub priority: i64,

    /// Notifiers to trigger when this file changes.
    #[serde(default)]
    pub notify: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifierConfig {
    /// Shell command to run. Mutually exclusive with `service`.
    #[serde(default)]
    pub command: Option<String>,

    /// Service to reload. Mutually exclusive with `command`.
    #[serde(default)]
    pub service: Option<String>,

    /// Notification timeout as a human readable duration. Defaults to
    /// five minutes.
    #[serde(default)]
    pub timeout: Option<String>,
}

impl Pouchfile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let d = fs::read_to_string(path)?;
        Self::parse(&d)
    }

    pub fn parse(d: &str) -> Result<Self, Error> {
        let pouchfile: Pouchfile = serde_yaml::from_str(d)?;
        pouchfile.validate()?;
        Ok(pouchfile)
    }

    fn validate(&self) -> Result<(), Error> {
        for file in &self.files {
            match (&file.template, &file.template_file) {
                (Some(_), Some(_)) => {
                    return Err(Error::AmbiguousTemplate(file.path.clone()));
                }
                (None, None) => {
                    return Err(Error::MissingTemplate(file.path.clone()));
                }
                _ => (),
            }
            for name in &file.notify {
                if !self.notifiers.contains_key(name) {
                    return Err(Error::UnknownNotifier(name.clone()));
                }
            }
        }
        Ok(())
    }
}
