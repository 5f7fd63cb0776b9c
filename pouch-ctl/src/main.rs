use std::process;

use clap::Parser;
use http::Method;
use tokio_util::sync::CancellationToken;

use pouch_vault::{Config, RequestOptions, Vault, VaultClient, APPROLE_URL};

mod sender;

/// Requests wrapped secret IDs for an AppRole role and delivers them to
/// a destination where an agent is waiting for them: stdout by default,
/// or a remote path over ssh.
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None, version)]
struct Args {
    /// Destination for the wrapped secret: `ssh://[user@]host[:port]/abs/path`,
    /// or stdout when not given.
    #[clap(long)]
    copy_to: Option<String>,

    /// Role to request a secret from.
    #[clap(long)]
    role: String,

    /// TTL for the wrapped secret ID.
    #[clap(long, default_value = "60s")]
    wrap_ttl: String,

    /// Address of the secret store server, VAULT_ADDR can be used
    /// instead.
    #[clap(long)]
    address: Option<String>,

    /// Token for authentication on the secret store, VAULT_TOKEN can be
    /// used instead.
    #[clap(long)]
    token: Option<String>,

    /// Generate a wrapped secret ID.
    #[clap(long)]
    gen_secret: bool,

    /// Show the role ID.
    #[clap(long)]
    show_role_id: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::builder().format_timestamp_millis().init();

    let vault = VaultClient::new(
        Config {
            address: args.address.unwrap_or_default(),
            token: args.token.unwrap_or_default(),
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .unwrap_or_else(|e| {
        eprintln!("{e}");
        process::exit(-1);
    });

    if args.show_role_id {
        let url = format!("{APPROLE_URL}/{}/role-id", args.role);
        let role_id = match vault.request(Method::GET, &url, None).await {
            Ok(secret) => secret
                .and_then(|s| s.data)
                .and_then(|d| d.get("role_id").and_then(|r| r.as_str()).map(String::from)),
            Err(e) => {
                eprintln!("Couldn't get role ID: {e}");
                process::exit(-1);
            }
        };
        match role_id {
            Some(role_id) => println!("RoleID: {role_id}"),
            None => {
                eprintln!("No role ID found in response");
                process::exit(-1);
            }
        }
    }

    if !args.gen_secret {
        println!("Use --gen-secret to obtain a wrapped secret");
        return;
    }

    let sender = match sender::for_destination(args.copy_to.as_deref()) {
        Ok(sender) => sender,
        Err(e) => {
            eprintln!("{e}");
            process::exit(-1);
        }
    };

    let url = format!("{APPROLE_URL}/{}/secret-id", args.role);
    let options = RequestOptions {
        wrap_ttl: Some(args.wrap_ttl),
        ..Default::default()
    };
    let wrapped = match vault.request(Method::POST, &url, Some(&options)).await {
        Ok(secret) => secret.and_then(|s| s.wrap_info).map(|w| w.token),
        Err(e) => {
            eprintln!("Couldn't get wrapped secret ID: {e}");
            process::exit(-1);
        }
    };
    let Some(wrapped) = wrapped else {
        eprintln!("No wrapping information found in response");
        process::exit(-1);
    };

    if let Err(e) = sender.send(&wrapped).await {
        eprintln!("Couldn't send secret: {e}");
        process::exit(-1);
    }
}
