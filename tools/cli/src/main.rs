//! CloudStash CLI - Command line interface for object storage operations.
//!
//! Moves files to and from AWS S3, Google Cloud Storage or Azure Blob
//! Storage, selected by a JSON configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudstash_common::ObjectKey;
use cloudstash_storage::{
    create_provider, AwsSigner, DownloadSink, Downloaded, ProviderConfig, StorageProvider,
    UploadSource,
};

#[derive(Parser)]
#[command(name = "cloudstash")]
#[command(about = "CloudStash - Move files to and from cloud object storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Provider configuration file.
    #[arg(short, long, env = "CLOUDSTASH_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file.
    Upload {
        /// Local file to read.
        local: PathBuf,

        /// Remote key to write.
        remote: String,
    },

    /// Download an object to a local file.
    Download {
        /// Remote key to read.
        remote: String,

        /// Local file to write.
        local: PathBuf,
    },

    /// Print an object to stdout.
    Cat {
        /// Remote key to read.
        remote: String,
    },

    /// Delete an object.
    Delete {
        /// Remote key to delete.
        remote: String,
    },

    /// List keys under a prefix (AWS only).
    List {
        /// Key prefix (default: whole bucket).
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Print a presigned GET URL (AWS only).
    Presign {
        /// Remote key to share.
        remote: String,

        /// Validity in seconds.
        #[arg(short, long, default_value_t = 3600)]
        expires: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ProviderConfig::from_json_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Upload { local, remote } => cmd_upload(&config, &local, &remote).await,
        Commands::Download { remote, local } => cmd_download(&config, &remote, local).await,
        Commands::Cat { remote } => cmd_cat(&config, &remote).await,
        Commands::Delete { remote } => cmd_delete(&config, &remote).await,
        Commands::List { prefix } => cmd_list(&config, &prefix).await,
        Commands::Presign { remote, expires } => cmd_presign(&config, &remote, expires),
    }
}

/// Build the configured provider.
fn open_provider(config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>> {
    let provider = create_provider(config).context("Failed to create storage provider")?;
    info!("Using {}", provider.name());
    Ok(provider)
}

/// Parse a remote key.
fn parse_key(remote: &str) -> Result<ObjectKey> {
    ObjectKey::parse(remote).map_err(|e| anyhow::anyhow!("Invalid remote key '{}': {}", remote, e))
}

/// Upload a local file.
async fn cmd_upload(config: &ProviderConfig, local: &Path, remote: &str) -> Result<()> {
    let key = parse_key(remote)?;
    let provider = open_provider(config)?;
    info!("Uploading {} to {}", local.display(), key);

    let receipt = provider
        .upload(UploadSource::path(local), &key)
        .await
        .context("Upload failed")?;

    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

/// Download an object to a local file.
async fn cmd_download(config: &ProviderConfig, remote: &str, local: PathBuf) -> Result<()> {
    let key = parse_key(remote)?;
    let provider = open_provider(config)?;
    info!("Downloading {} to {}", key, local.display());

    match provider
        .download(&key, DownloadSink::File(local))
        .await
        .context("Download failed")?
    {
        Downloaded::File {
            path,
            bytes_written,
        } => println!("Wrote {} bytes to {}", bytes_written, path.display()),
        _ => anyhow::bail!("Provider returned a non-file download result"),
    }
    Ok(())
}

/// Print an object to stdout.
async fn cmd_cat(config: &ProviderConfig, remote: &str) -> Result<()> {
    let key = parse_key(remote)?;
    let provider = open_provider(config)?;
    let bytes = provider
        .download(&key, DownloadSink::Buffer)
        .await
        .context("Download failed")?
        .collect()
        .await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&bytes).await?;
    stdout.flush().await?;
    Ok(())
}

/// Delete an object.
async fn cmd_delete(config: &ProviderConfig, remote: &str) -> Result<()> {
    let key = parse_key(remote)?;
    let provider = open_provider(config)?;
    provider.delete(&key).await.context("Delete failed")?;
    println!("Deleted {}", key);
    Ok(())
}

/// List keys under a prefix.
async fn cmd_list(config: &ProviderConfig, prefix: &str) -> Result<()> {
    let prefix = parse_key(prefix)?;
    let provider = open_provider(config)?;
    let keys = provider.list(&prefix).await.context("List failed")?;

    if keys.is_empty() {
        println!("(no objects)");
    }
    for key in keys {
        println!("{}", key);
    }
    Ok(())
}

/// Print a presigned GET URL.
fn cmd_presign(config: &ProviderConfig, remote: &str, expires: u64) -> Result<()> {
    let aws = config
        .aws
        .as_ref()
        .context("Presigned URLs require an 'aws' configuration block")?;
    let key = parse_key(remote)?;

    let signer = AwsSigner::new(aws).context("Invalid AWS configuration")?;
    let url = signer
        .presign_get(&key, expires)
        .context("Failed to presign URL")?;

    println!("{}", url);
    Ok(())
}
