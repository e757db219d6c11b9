//! gangway - modular, configurable SSH server
//!
//! Loads a JSON config (or adapts an sshd_config-style file), provisions
//! the app, and serves until interrupted.

use anyhow::{bail, Context, Result};
use tracing::info;

use gangway::adapter;
use gangway::app::App;
use gangway::authn::static_users;
use gangway::config::ConfigFile;

const DEFAULT_CONFIG_PATH: &str = "gangway.json";

fn usage() -> ! {
    eprintln!(
        "usage: gangway [--config <path>] [--sshd-config <path>]\n\
         \x20      gangway hash-password <password> [salt]"
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // utility mode: derive a password digest for the static provider
    if args.first().map(String::as_str) == Some("hash-password") {
        let password = args.get(1).unwrap_or_else(|| usage());
        let salt = args.get(2).map(String::as_str).unwrap_or("");
        let digest = static_users::hash_password(
            password,
            salt.as_bytes(),
            static_users::DEFAULT_ROUNDS,
        );
        println!("{digest}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gangway=info".parse()?),
        )
        .init();

    let config = load_config(&args)?;
    let mut app = App::provision(&config.ssh).context("provisioning ssh app")?;
    app.start().await.context("starting ssh app")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
        result = app.wait() => {
            result?;
        }
    }

    app.stop().await
}

fn load_config(args: &[String]) -> Result<ConfigFile> {
    let mut config_path: Option<&str> = None;
    let mut sshd_config_path: Option<&str> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => match iter.next() {
                Some(path) => config_path = Some(path),
                None => usage(),
            },
            "--sshd-config" => match iter.next() {
                Some(path) => sshd_config_path = Some(path),
                None => usage(),
            },
            _ => usage(),
        }
    }

    match (config_path, sshd_config_path) {
        (Some(_), Some(_)) => bail!("--config and --sshd-config are mutually exclusive"),
        (None, Some(path)) => {
            let body = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {path}"))?;
            let (config, warnings) = adapter::adapt(&body)?;
            info!(
                path,
                warnings = warnings.len(),
                "adapted sshd_config input"
            );
            Ok(config)
        }
        (path, None) => ConfigFile::load(path.unwrap_or(DEFAULT_CONFIG_PATH)),
    }
}
