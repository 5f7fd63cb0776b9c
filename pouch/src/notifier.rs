//! Notification of dependent services when rendered files change:
//! either a shell command run under a deadline, or a service reload
//! through the host's service manager.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::{process::Command, time};

use crate::{pouchfile::NotifierConfig, Error};

pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Reloads a service by name through whatever supervises it.
#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self, service: &str) -> Result<(), Error>;
}

enum NotifierRunner<'a> {
    Command(&'a str),
    Service(&'a str),
}

impl NotifierRunner<'_> {
    async fn run(
        &self,
        reloader: Option<&dyn Reloader>,
        timeout: Duration,
    ) -> Result<String, Error> {
        match self {
            Self::Command(command) => {
                let run = async {
                    let output = Command::new("sh")
                        .arg("-c")
                        .arg(command)
                        .kill_on_drop(true)
                        .output()
                        .await?;
                    let mut combined = output.stdout;
                    combined.extend(&output.stderr);
                    let combined = String::from_utf8_lossy(&combined).into_owned();
                    if output.status.success() {
                        Ok(combined)
                    } else {
                        Err(Error::NotifierCommand(output.status, combined))
                    }
                };
                match time::timeout(timeout, run).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::NotifierTimeout),
                }
            }
            Self::Service(service) => {
                let reloader = reloader.ok_or(Error::NoReloader)?;
                match time::timeout(timeout, reloader.reload(service)).await {
                    Ok(result) => result.map(|()| String::new()),
                    Err(_) => Err(Error::NotifierTimeout),
                }
            }
        }
    }
}

fn notifier_runner(config: &NotifierConfig) -> Result<NotifierRunner<'_>, Error> {
    match (config.command.as_deref(), config.service.as_deref()) {
        (Some(command), None) => Ok(NotifierRunner::Command(command)),
        (None, Some(service)) => Ok(NotifierRunner::Service(service)),
        _ => Err(Error::InvalidNotifier),
    }
}

fn notifier_timeout(config: &NotifierConfig) -> Duration {
    match config.timeout.as_deref() {
        Some(timeout) => match humantime::parse_duration(timeout) {
            Ok(timeout) => timeout,
            Err(e) => {
                warn!("Incorrect timeout: {e}");
                DEFAULT_NOTIFY_TIMEOUT
            }
        },
        None => DEFAULT_NOTIFY_TIMEOUT,
    }
}

/// Fire a single named notifier. Failures are logged along with any
/// output the notifier produced; they never propagate.
pub(crate) async fn notify(
    name: &str,
    config: Option<&NotifierConfig>,
    reloader: Option<&dyn Reloader>,
) {
    let Some(config) = config else {
        warn!("Couldn't find notifier for '{name}'");
        return;
    };

    let runner = match notifier_runner(config) {
        Ok(runner) => runner,
        Err(e) => {
            warn!("Couldn't configure notifier for '{name}': {e}");
            return;
        }
    };

    if let Err(e) = runner.run(reloader, notifier_timeout(config)).await {
        warn!("Notification to '{name}' failed: {e}");
    }
}
