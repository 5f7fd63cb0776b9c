use std::{error::Error, path::PathBuf};

use clap::Parser;
use log::info;
use tokio_util::sync::CancellationToken;

use pouch::{
    pouchfile::{Pouchfile, DEFAULT_POUCHFILE_PATH},
    state::{PouchState, DEFAULT_STATE_PATH},
    systemd::{Systemd, SystemctlReloader},
    Pouch,
};
use pouch_vault::VaultClient;

/// Long-running agent that authenticates against a Vault style secret
/// store with an AppRole credential, renders the configured secrets into
/// local files, notifies the services using them, and keeps everything
/// fresh for the lifetime of the host.
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None, version)]
struct Args {
    /// Path to the Pouchfile configuration document.
    #[clap(env, long, default_value = DEFAULT_POUCHFILE_PATH)]
    pouchfile: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder().format_timestamp_millis().init();

    let pouchfile = Pouchfile::load(&args.pouchfile)?;
    let state_path = pouchfile
        .state_path
        .clone()
        .unwrap_or_else(|| DEFAULT_STATE_PATH.to_string());

    let state = match PouchState::load(&state_path) {
        Ok(state) => {
            info!("Using state stored in {}", state.path.display());
            state
        }
        Err(e) => {
            info!("Couldn't load state: {e}, starting from scratch");
            PouchState::new(&state_path)
        }
    };

    let mut vault_config = pouchfile.vault.clone();
    if !state.token.is_empty() {
        vault_config.token = state.token.clone();
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let has_token = !state.token.is_empty() || !vault_config.token.is_empty();

    let vault = VaultClient::new(vault_config, shutdown.clone())?;
    let mut pouch = Pouch::new(
        state,
        vault,
        pouchfile.secrets,
        pouchfile.files,
        pouchfile.notifiers,
    );

    let systemd = Systemd::new(&pouchfile.systemd);
    if systemd.is_available() {
        pouch.add_status_notifier(Box::new(systemd));
        pouch.set_reloader(Box::new(SystemctlReloader));
    }

    if let Some(path) = pouchfile.wrapped_secret_id_path.as_deref() {
        if !has_token {
            info!("Waiting for a wrapped secret ID in {path}");
            pouch.watch(path, &shutdown).await?;
        }
    }
    if shutdown.is_cancelled() {
        return Ok(());
    }

    pouch.run(shutdown).await?;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => (),
            _ = terminate => (),
        }
        info!("Shutting down");
        shutdown.cancel();
    });
}
