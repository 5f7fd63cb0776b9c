use std::{
    error::Error,
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use pouch_vault::{Config, Vault, VaultClient};

const OUTPUT_MODE: u32 = 0o640;

/// Logs into a Vault style secret store with an AppRole credential and
/// prints the resulting client token, ready to be sourced into the
/// environment of other tools.
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None, version)]
struct Args {
    /// Address of the secret store server, VAULT_ADDR can be used
    /// instead.
    #[clap(long)]
    address: Option<String>,

    /// Role ID to use for login.
    #[clap(long)]
    role_id: String,

    /// Secret ID to use for login.
    #[clap(long)]
    secret_id: Option<String>,

    /// Path to a file containing a wrapped secret ID.
    #[clap(long)]
    wrapped_secret_id_path: Option<PathBuf>,

    /// Path to write the token to, instead of stdout.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Print the bare token instead of an environment assignment.
    #[clap(long)]
    raw: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder().format_timestamp_millis().init();

    let vault = VaultClient::new(
        Config {
            address: args.address.unwrap_or_default(),
            role_id: args.role_id,
            secret_id: args.secret_id.unwrap_or_default(),
            ..Default::default()
        },
        CancellationToken::new(),
    )?;

    if let Some(path) = args.wrapped_secret_id_path {
        let wrapped = fs::read_to_string(path)?;
        vault.unwrap_secret_id(wrapped.trim()).await?;
    }

    vault.login().await?;
    let token = vault.get_token().await.unwrap_or_default();

    let line = if args.raw {
        format!("{token}\n")
    } else {
        format!("VAULT_TOKEN={token}\n")
    };

    match args.output {
        Some(path) => {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(OUTPUT_MODE);
            options.open(path)?.write_all(line.as_bytes())?;
        }
        None => print!("{line}"),
    }

    Ok(())
}
