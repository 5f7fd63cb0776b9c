//! Waits for a one-time wrapped secret ID to be dropped on a filesystem
//! path by an operator tool. The parent directory is watched rather than
//! the file itself; rename-replace and truncate-write sequences do not
//! reliably produce events on the file node.

use std::path::{Path, PathBuf};

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::{fs, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Obtain the contents of the wrapped secret ID file at `path`, waiting
/// for it to appear when necessary. Returns `None` on cancellation.
pub(crate) async fn await_wrapped(
    path: &Path,
    shutdown: &CancellationToken,
) -> Result<Option<String>, Error> {
    if let Some(wrapped) = read_wrapped(path).await? {
        return Ok(Some(wrapped));
    }

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = mpsc::channel(16);
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.blocking_send(event);
    })
    .map_err(Error::Watch)?;
    watcher.watch(&dir, RecursiveMode::NonRecursive).map_err(Error::Watch)?;

    // The file may have been written between the first read and the
    // watch installation.
    if let Some(wrapped) = read_wrapped(path).await? {
        return Ok(Some(wrapped));
    }

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            event = rx.recv() => match event {
                Some(event) => event.map_err(Error::Watch)?,
                None => return Ok(None),
            },
        };

        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        let for_path = event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name());
        if !for_path {
            continue;
        }

        if let Some(wrapped) = read_wrapped(path).await? {
            return Ok(Some(wrapped));
        }
    }
}

pub(crate) async fn read_wrapped(path: &Path) -> Result<Option<String>, Error> {
    match fs::read_to_string(path).await {
        Ok(d) => {
            let wrapped = d.trim();
            if wrapped.is_empty() {
                Ok(None)
            } else {
                Ok(Some(wrapped.to_string()))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use std::{env, time::Duration};

    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn returns_preexisting_contents() {
        let dir = env::temp_dir().join("pouch-fs-watcher-preexisting");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("wrapped");
        std::fs::write(&path, "wrap\n").unwrap();

        let wrapped = await_wrapped(&path, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(wrapped.as_deref(), Some("wrap"));
    }

    #[test(tokio::test)]
    async fn waits_for_the_file_to_appear() {
        let dir = env::temp_dir().join("pouch-fs-watcher-appear");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("wrapped");

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&writer_path, "wrap").unwrap();
        });

        let wrapped = await_wrapped(&path, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(wrapped.as_deref(), Some("wrap"));
        writer.await.unwrap();
    }

    #[test(tokio::test)]
    async fn cancellation_stops_the_watch() {
        let dir = env::temp_dir().join("pouch-fs-watcher-cancel");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("wrapped");

        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let wrapped = await_wrapped(&path, &shutdown).await.unwrap();
        assert!(wrapped.is_none());
    }

    #[test(tokio::test)]
    async fn empty_files_keep_the_watch_alive() {
        let dir = env::temp_dir().join("pouch-fs-watcher-empty");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("wrapped");
        std::fs::write(&path, "").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&writer_path, "wrap").unwrap();
        });

        let wrapped = await_wrapped(&path, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(wrapped.as_deref(), Some("wrap"));
        writer.await.unwrap();
    }
}
