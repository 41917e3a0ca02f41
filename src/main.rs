use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};

mod checksum;
mod client;
mod compression;
mod errors;
mod manifest;
mod publisher;
mod selfupdate;
mod sources;
mod storage;
#[cfg(test)]
mod testutil;
mod util;

use errors::{Result, UpdaterError};
use publisher::UploadConfig;

#[derive(Parser, Debug)]
#[command(
    name = "distsync",
    author,
    version,
    about = "Publishes and reconciles versioned file distributions"
)]
struct Cli {
    /// Staged self-update copy to clean up after start.
    #[arg(long, hide = true, global = true)]
    delete: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Update the installed product and launch it (the default).
    Run(RunArgs),
    /// Scan a distribution root and publish changed files plus the manifest.
    Publish(PublishArgs),
    /// Publish an agent binary to the self-update channel.
    PublishAgent(PublishAgentArgs),
    #[command(hide = true)]
    UpdateSelf(UpdateSelfArgs),
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Path to sources.json; defaults to the working and executable
    /// directories.
    #[arg(long)]
    sources: Option<PathBuf>,
    /// Directory to install channels under; defaults to the working
    /// directory.
    #[arg(long)]
    install_root: Option<PathBuf>,
    /// Unattended mode: retry downloads until they succeed, do not launch.
    #[arg(long)]
    batch: bool,
    #[arg(long)]
    skip_self_update: bool,
}

#[derive(clap::Args, Debug)]
struct PublishArgs {
    /// Publisher config file; a default template is written when missing.
    #[arg(long, default_value = "./config.json")]
    config: PathBuf,
    /// Entire publisher config as base64-encoded JSON, for CI pipelines.
    #[arg(long)]
    base64: Option<String>,
    /// Override the configured distribution root.
    #[arg(long)]
    distribution_root: Option<String>,
    /// Update-log line for this release; repeatable.
    #[arg(long = "update-log")]
    update_logs: Vec<String>,
    /// Do not write the resolved build id back into the config file.
    #[arg(long)]
    no_write_back: bool,
}

#[derive(clap::Args, Debug)]
struct PublishAgentArgs {
    /// Publisher config file naming the storage backend.
    #[arg(long, default_value = "./config.json")]
    config: PathBuf,
    /// Runtime tag the binary is published for (win, osx, linux).
    #[arg(long)]
    os: String,
    /// The agent binary to publish.
    #[arg(long)]
    path: PathBuf,
    #[arg(long)]
    build_id: u64,
}

#[derive(clap::Args, Debug)]
struct UpdateSelfArgs {
    /// The original agent binary to overwrite with this staged copy.
    #[arg(long)]
    program_path: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Cleanup of a finished self-update runs alongside the session.
    let cleanup = cli.delete.map(|staged| {
        tokio::spawn(async move {
            selfupdate::delete_staged(&staged).await;
        })
    });

    let result = match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => run(args).await,
        Command::Publish(args) => publish(args).await,
        Command::PublishAgent(args) => publish_agent(args).await,
        Command::UpdateSelf(args) => selfupdate::run_update_self(&args.program_path).await,
    };

    if let Some(handle) = cleanup {
        let _ = handle.await;
    }

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(args: RunArgs) -> Result<()> {
    client::run(client::RunOptions {
        sources_path: args.sources,
        install_root: args.install_root,
        batch: args.batch,
        skip_self_update: args.skip_self_update,
    })
    .await
}

async fn publish(args: PublishArgs) -> Result<()> {
    let mut config = load_upload_config(&args).await?;
    if let Some(root) = args.distribution_root {
        config.distribution_root = root;
    }

    let outcome = publisher::publish(&mut config, &args.update_logs).await?;
    info!(
        "published build {}: {} uploaded, {} unchanged",
        outcome.manifest.build_id,
        outcome.uploaded_keys.len(),
        outcome.skipped
    );

    if args.base64.is_none() && !args.no_write_back {
        let bytes = serde_json::to_vec_pretty(&config)
            .map_err(|e| UpdaterError::Config(format!("failed to serialize config: {e}")))?;
        tokio::fs::write(&args.config, &bytes)
            .await
            .map_err(UpdaterError::Io)?;
    }
    Ok(())
}

/// Load the publisher config from `--base64` or the config file. When the
/// file is missing a default template is written in its place so the
/// operator can fill it in.
async fn load_upload_config(args: &PublishArgs) -> Result<UploadConfig> {
    if let Some(encoded) = &args.base64 {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| UpdaterError::Config(format!("invalid base64 config: {e}")))?;
        return serde_json::from_slice(&bytes)
            .map_err(|e| UpdaterError::Config(format!("invalid config json: {e}")));
    }

    match tokio::fs::read(&args.config).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            UpdaterError::Config(format!("failed to parse {}: {e}", args.config.display()))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let template = serde_json::to_vec_pretty(&UploadConfig::default())
                .map_err(|e| UpdaterError::Config(format!("failed to serialize template: {e}")))?;
            tokio::fs::write(&args.config, &template)
                .await
                .map_err(UpdaterError::Io)?;
            info!("wrote default config template to {}", args.config.display());
            Err(UpdaterError::Config(format!(
                "{} did not exist; fill in the generated template and rerun",
                args.config.display()
            )))
        }
        Err(err) => Err(UpdaterError::Io(err)),
    }
}

async fn publish_agent(args: PublishAgentArgs) -> Result<()> {
    let bytes = tokio::fs::read(&args.config).await.map_err(UpdaterError::Io)?;
    let config: UploadConfig = serde_json::from_slice(&bytes).map_err(|e| {
        UpdaterError::Config(format!("failed to parse {}: {e}", args.config.display()))
    })?;

    if !["win", "osx", "linux"].contains(&args.os.as_str()) {
        return Err(UpdaterError::Config(format!(
            "unknown runtime tag {:?} (expected win, osx or linux)",
            args.os
        )));
    }

    let check = checksum::resolve(&config.checksum)?;
    let backend = storage::resolve(&config.storage, config.local.as_ref(), check)?;
    publisher::publish_agent(backend, &args.os, &args.path, args.build_id).await
}
