//! Persistent record of the agent's view of the world: the last known
//! client token and per-secret metadata, together with the scheduling
//! logic that decides which secret to refresh next.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    slice,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::DirBuilderExt;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x509_cert::{der::Decode, Certificate};

use crate::Error;

pub const DEFAULT_STATE_PATH: &str = "/var/lib/pouch/state";
pub const DEFAULT_SECRET_DURATION_RATIO: f64 = 0.75;

const STATE_MODE: u32 = 0o600;
const STATE_DIR_MODE: u32 = 0o700;

const PREVIOUS_STATE_POSTFIX: &str = "-prev";

/// Priority assigned to each file on load, spaced so that files inserted
/// later can be ordered between existing ones.
const LOAD_PRIORITY_STRIDE: i64 = 10;

pub type SecretData = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PouchState {
    /// Last known token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,

    /// Secrets state
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretState>,

    /// Path from where this state was read
    #[serde(skip)]
    pub path: PathBuf,
}

impl PouchState {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path = path.into();
        let d = fs::read(&path)?;
        let mut state: PouchState = serde_json::from_slice(&d)?;
        state.path = path;
        Ok(state)
    }

    /// Persist the state. The previous contents, if any, are first copied
    /// next to the state file so that a partial write cannot lose the
    /// last good state.
    pub fn save(&self) -> Result<(), Error> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                builder.mode(STATE_DIR_MODE);
                builder.create(dir)?;
            }
        }

        if self.path.exists() {
            let d = fs::read(&self.path)?;
            let mut prev = self.path.as_os_str().to_os_string();
            prev.push(PREVIOUS_STATE_POSTFIX);
            crate::write_file(Path::new(&prev), &d, STATE_MODE)?;
        }

        let d = serde_json::to_vec_pretty(self)?;
        crate::write_file(&self.path, &d, STATE_MODE)
    }

    /// Record the outcome of a secret read. Usage registrations from any
    /// prior state under this name are carried over, and the secret is
    /// marked non-updatable when no update instant can be derived from
    /// the response.
    pub fn set_secret(&mut self, name: &str, secret: &pouch_vault::Secret) {
        let mut state = SecretState {
            name: name.to_string(),
            timestamp: Utc::now(),
            lease_duration: secret.lease_duration,
            duration_ratio: 0.0,
            disable_auto_update: false,
            data: secret.data.clone().unwrap_or_default(),
            files_using: PriorityFileList::default(),
        };

        if state.time_to_update().is_none() {
            // Without a known TTU, we don't know when to update
            state.disable_auto_update = true;
        }

        if let Some(old_state) = self.secrets.get(name) {
            state.files_using = old_state.files_using.clone();
        }
        self.secrets.insert(name.to_string(), state);
    }

    pub fn delete_secret(&mut self, name: &str) {
        self.secrets.remove(name);
    }

    /// The next secret due for a refresh, with the time left until it is
    /// due, clamped at zero for overdue secrets.
    pub fn next_update(&self) -> Option<(&SecretState, Duration)> {
        let mut found: Option<(&SecretState, DateTime<Utc>)> = None;
        for secret in self.secrets.values() {
            if secret.disable_auto_update {
                continue;
            }
            if let Some(ttu) = secret.time_to_update() {
                if found.map_or(true, |(_, min_ttu)| ttu < min_ttu) {
                    found = Some((secret, ttu));
                }
            }
        }
        found.map(|(secret, ttu)| {
            let wait = (ttu - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            (secret, wait)
        })
    }
}

type TtuSource = fn(&SecretState) -> Result<Option<DateTime<Utc>>, Error>;

/// Sources of TTUs
const SECRET_TTU_SOURCES: &[TtuSource] = &[
    ttu_from_ttl_or_lease_duration,
    ttu_from_certificate_validity,
];

fn ttu_from_ttl_or_lease_duration(s: &SecretState) -> Result<Option<DateTime<Utc>>, Error> {
    // Only positive values count as expiry information.
    let duration = match s.ttl() {
        Some(ttl) if ttl > 0 && s.lease_duration > 0 => ttl.min(s.lease_duration),
        Some(ttl) if ttl > 0 => ttl,
        _ if s.lease_duration > 0 => s.lease_duration,
        _ => return Ok(None),
    };

    let ttu = s.timestamp
        + chrono::Duration::milliseconds((duration as f64 * s.ratio() * 1000.0) as i64);
    Ok(Some(ttu))
}

fn ttu_from_certificate_validity(s: &SecretState) -> Result<Option<DateTime<Utc>>, Error> {
    let Some(data) = s.data.get("certificate").and_then(|v| v.as_str()) else {
        return Ok(None);
    };

    let (_, der) = x509_cert::der::pem::decode_vec(data.trim().as_bytes())
        .map_err(|e| Error::Certificate(format!("failed to parse certificate PEM: {e}")))?;
    let certificate = Certificate::from_der(&der)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

    let validity = &certificate.tbs_certificate.validity;
    let not_before: DateTime<Utc> =
        (std::time::UNIX_EPOCH + validity.not_before.to_unix_duration()).into();
    let not_after: DateTime<Utc> =
        (std::time::UNIX_EPOCH + validity.not_after.to_unix_duration()).into();

    let ttl = not_after - not_before;
    let ttu = not_before
        + chrono::Duration::milliseconds((ttl.num_milliseconds() as f64 * s.ratio()) as i64);
    Ok(Some(ttu))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriorityFile {
    pub priority: i64,
    pub path: String,
}

/// Files using a secret, kept sorted by ascending priority and then by
/// path, with no duplicate paths. Serialized as a plain list of paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PriorityFileList(Vec<PriorityFile>);

impl PriorityFileList {
    pub fn iter(&self) -> slice::Iter<'_, PriorityFile> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<'a> IntoIterator for &'a PriorityFileList {
    type Item = &'a PriorityFile;
    type IntoIter = slice::Iter<'a, PriorityFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for PriorityFileList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|f| &f.path))
    }
}

impl<'de> Deserialize<'de> for PriorityFileList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let paths = Vec::<String>::deserialize(deserializer)?;

        // To keep the same state as when it was written, each file is
        // assigned a priority according to the order in which it appears
        // in the state file.
        Ok(Self(
            paths
                .into_iter()
                .enumerate()
                .map(|(i, path)| PriorityFile {
                    priority: i as i64 * LOAD_PRIORITY_STRIDE,
                    path,
                })
                .collect(),
        ))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SecretState {
    /// Secret name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Time when the secret was read
    #[serde(rename = "creation_time", default = "unix_epoch")]
    pub timestamp: DateTime<Utc>,

    /// Lease duration, in seconds, if any when the secret was read
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub lease_duration: i64,

    /// Secret will be renewed after this portion of its life has passed
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub duration_ratio: f64,

    /// If the secret has no expiration data, don't try to update it.
    /// The misspelled key is kept for state file compatibility.
    #[serde(
        rename = "disable_auto_uptdate",
        default,
        skip_serializing_if = "is_false"
    )]
    pub disable_auto_update: bool,

    /// Actual secret
    #[serde(default, skip_serializing_if = "SecretData::is_empty")]
    pub data: SecretData,

    /// Files using this secret
    #[serde(default, skip_serializing_if = "PriorityFileList::is_empty")]
    pub files_using: PriorityFileList,
}

impl Default for SecretState {
    fn default() -> Self {
        Self {
            name: String::new(),
            timestamp: unix_epoch(),
            lease_duration: 0,
            duration_ratio: 0.0,
            disable_auto_update: false,
            data: SecretData::new(),
            files_using: PriorityFileList::default(),
        }
    }
}

fn unix_epoch() -> DateTime<Utc> {
    std::time::UNIX_EPOCH.into()
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_i64(n: &i64) -> bool {
    *n == 0
}

fn is_zero_f64(n: &f64) -> bool {
    *n == 0.0
}

impl SecretState {
    pub fn ratio(&self) -> f64 {
        if self.duration_ratio == 0.0 {
            DEFAULT_SECRET_DURATION_RATIO
        } else {
            self.duration_ratio
        }
    }

    /// An explicit TTL in seconds, when the response data carries one as
    /// a JSON number.
    pub fn ttl(&self) -> Option<i64> {
        self.data.get("ttl").and_then(|ttl| ttl.as_i64())
    }

    /// The instant at which this secret should be refreshed: the minimum
    /// over all TTU sources that yield one.
    pub fn time_to_update(&self) -> Option<DateTime<Utc>> {
        let mut min_ttu = None;
        for source in SECRET_TTU_SOURCES {
            match source(self) {
                Ok(Some(ttu)) => {
                    if min_ttu.map_or(true, |min| ttu < min) {
                        min_ttu = Some(ttu);
                    }
                }
                Ok(None) => (),
                Err(e) => {
                    warn!("Error trying to obtain TTU for secret '{}': {e}", self.name);
                }
            }
        }
        min_ttu
    }

    /// Record that a file is rendered from this secret. Registering the
    /// same path again is a no-op.
    pub fn register_usage(&mut self, path: &str, priority: i64) {
        if self.files_using.0.iter().any(|f| f.path == path) {
            // Already registered
            return;
        }
        self.files_using.0.push(PriorityFile {
            priority,
            path: path.to_string(),
        });
        self.files_using
            .0
            .sort_unstable_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.path.cmp(&b.path)));
    }
}
