//! Delivery of wrapped secrets to where an agent can pick them up.

use std::{error::Error, fmt, process::Stdio};

use tokio::{io::AsyncWriteExt, process::Command};
use url::Url;

#[derive(Debug)]
pub enum SenderError {
    Destination(String),
    Io(std::io::Error),
    Ssh(String),
}

impl fmt::Display for SenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destination(destination) => {
                write!(f, "destination not supported: {destination}")
            }
            Self::Io(e) => fmt::Display::fmt(e, f),
            Self::Ssh(output) => write!(f, "ssh error: {output}"),
        }
    }
}

impl Error for SenderError {}

impl From<std::io::Error> for SenderError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub enum Sender {
    Stdout,
    Ssh(Url),
}

/// Pick a sender for a destination. No destination means stdout.
pub fn for_destination(destination: Option<&str>) -> Result<Sender, SenderError> {
    let Some(destination) = destination else {
        return Ok(Sender::Stdout);
    };

    let url = Url::parse(destination)
        .map_err(|_| SenderError::Destination(destination.to_string()))?;
    match url.scheme() {
        "ssh" | "scp" | "sftp" => Ok(Sender::Ssh(url)),
        _ => Err(SenderError::Destination(destination.to_string())),
    }
}

impl Sender {
    pub async fn send(&self, secret: &str) -> Result<(), SenderError> {
        match self {
            Self::Stdout => {
                println!("{secret}");
                Ok(())
            }
            Self::Ssh(url) => send_over_ssh(url, secret).await,
        }
    }
}

// Implemented over the ssh command with output redirection, for two main
// reasons: to make use of the client's ssh configuration and keys, and
// to avoid writing the secret to disk.
async fn send_over_ssh(url: &Url, secret: &str) -> Result<(), SenderError> {
    let mut command = Command::new("ssh");
    if !url.username().is_empty() {
        command.arg("-l").arg(url.username());
    }
    if let Some(port) = url.port() {
        command.arg("-p").arg(port.to_string());
    }
    command
        .arg(url.host_str().unwrap_or_default())
        .arg(format!("cat > '{}'", url.path()));

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(secret.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let mut combined = output.stdout;
        combined.extend(&output.stderr);
        return Err(SenderError::Ssh(
            String::from_utf8_lossy(&combined).into_owned(),
        ));
    }
    Ok(())
}
