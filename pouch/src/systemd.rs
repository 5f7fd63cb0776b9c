//! systemd integration behind the narrow seams the agent consumes: a
//! readiness/reload handshake and a service reloader.

use std::env;

use async_trait::async_trait;
use log::info;
use tokio::process::Command;

use crate::{notifier::Reloader, pouchfile::SystemdConfig, Error};

/// Tells the supervising service manager how the agent is doing.
pub trait StatusNotifier: Send + Sync {
    fn notify_ready(&self) -> Result<(), Error>;
    fn notify_reload(&self) -> Result<(), Error>;
}

pub struct Systemd {
    enabled: Option<bool>,
}

impl Systemd {
    pub fn new(config: &SystemdConfig) -> Self {
        Self {
            enabled: config.enabled,
        }
    }

    /// Whether the agent runs under systemd and should talk to it. An
    /// explicit `enabled: false` always wins.
    pub fn is_available(&self) -> bool {
        if self.enabled == Some(false) {
            return false;
        }
        if env::var_os("NOTIFY_SOCKET").is_none() {
            info!("no notification socket, systemd notifications disabled");
            return false;
        }
        true
    }
}

impl StatusNotifier for Systemd {
    fn notify_ready(&self) -> Result<(), Error> {
        sd_notify::notify(false, &[sd_notify::NotifyState::Ready])
            .map_err(|e| Error::StatusNotification(e.to_string()))
    }

    fn notify_reload(&self) -> Result<(), Error> {
        sd_notify::notify(false, &[sd_notify::NotifyState::Reloading])
            .map_err(|e| Error::StatusNotification(e.to_string()))
    }
}

/// Reloads services with `systemctl reload-or-restart`.
pub struct SystemctlReloader;

#[async_trait]
impl Reloader for SystemctlReloader {
    async fn reload(&self, service: &str) -> Result<(), Error> {
        let output = Command::new("systemctl")
            .arg("reload-or-restart")
            .arg(service)
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Reload(
                service.to_string(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }
}
