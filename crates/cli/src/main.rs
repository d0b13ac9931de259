//! Operator CLI for packyard.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use packyard_core::config::AppConfig;
use packyard_installer::{
    Actor, ArtifactLoader, BundleBuilder, HttpArtifactSource, InstallRequest, PackInstaller,
    ReleaseReport, RollbackRequest,
};
use packyard_metadata::repos::{ReleaseFilter, ReleaseStatus};
use packyard_signer::{KeyPair, KeyRing, PackSigner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "packyard")]
#[command(about = "Install, inspect and roll back signed configuration packs")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(
        long,
        global = true,
        env = "PACKYARD_CONFIG",
        default_value = "config/packyard.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ActorArgs {
    /// Id of the user (or service, with --service) performing the operation
    #[arg(long)]
    actor: Option<String>,

    /// Record the actor as a service account
    #[arg(long, default_value_t = false, requires = "actor")]
    service: bool,
}

impl ActorArgs {
    fn to_actor(&self) -> Actor {
        match (&self.actor, self.service) {
            (Some(id), true) => Actor::service(id),
            (Some(id), false) => Actor::user(id),
            (None, _) => Actor::system(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Verify and apply a pack bundle
    Install {
        /// Pack code
        #[arg(long = "pack")]
        pack_code: String,
        /// Release id (e.g. 20240601.001)
        #[arg(long = "release")]
        release_id: String,
        /// Bundle URL (http, https or file)
        #[arg(long)]
        url: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Roll back the latest applied release of a pack
    Rollback {
        /// Release record id
        #[arg(long, conflicts_with_all = ["pack_code", "release_id"])]
        id: Option<Uuid>,
        /// Pack code
        #[arg(long = "pack", requires = "release_id")]
        pack_code: Option<String>,
        /// Release id
        #[arg(long = "release", requires = "pack_code")]
        release_id: Option<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// List release records, newest first
    Releases {
        /// Only this pack
        #[arg(long = "pack")]
        pack_code: Option<String>,
        /// Only this status (applying, applied, skipped, failed, rolled_back)
        #[arg(long)]
        status: Option<String>,
        /// Maximum number of records (default 50, at most 200)
        #[arg(long, default_value_t = 0)]
        limit: u32,
    },
    /// Show one release record
    Show {
        /// Release record id
        id: Uuid,
    },
    /// Signing key commands
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Bundle commands
    Bundle {
        #[command(subcommand)]
        command: BundleCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new signing key pair
    Generate {
        /// Key id packs will name in signing.public_key_id
        #[arg(short, long)]
        key_id: String,
        /// Output file for secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the public key for a secret key file
    Public {
        /// Path to secret key file
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum BundleCommands {
    /// Build and sign a bundle from a pack source directory
    Build {
        /// Directory containing manifest.yaml and the assets it lists
        #[arg(long)]
        dir: PathBuf,
        /// Secret key file written by `key generate`
        #[arg(long = "secret-key-file")]
        key_file: PathBuf,
        /// Output zip path
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Verify a bundle against the configured keys without installing it
    Verify {
        /// Bundle zip path
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    // stdout carries JSON results, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match command {
        Commands::Install {
            pack_code,
            release_id,
            url,
            actor,
        } => {
            let installer = open_installer(&config).await?;
            let request =
                InstallRequest::new(pack_code, release_id, url).with_actor(actor.to_actor());
            let outcome = installer
                .install_pack(request)
                .await
                .map_err(|e| anyhow::anyhow!("install failed [{}]: {e}", e.code()))?;
            print_json(&serde_json::json!({
                "release": ReleaseReport::from(&outcome.release),
                "summary": outcome.summary,
            }))
        }
        Commands::Rollback {
            id,
            pack_code,
            release_id,
            actor,
        } => {
            let request = match (id, pack_code, release_id) {
                (Some(id), _, _) => RollbackRequest::by_record(id),
                (None, Some(pack_code), Some(release_id)) => {
                    RollbackRequest::by_release(pack_code, release_id)
                }
                _ => anyhow::bail!("either --id or both --pack and --release are required"),
            };
            let installer = open_installer(&config).await?;
            let outcome = installer
                .rollback_pack(request.with_actor(actor.to_actor()))
                .await
                .map_err(|e| anyhow::anyhow!("rollback failed [{}]: {e}", e.code()))?;
            print_json(&serde_json::json!({
                "release": ReleaseReport::from(&outcome.release),
                "summary": outcome.summary,
            }))
        }
        Commands::Releases {
            pack_code,
            status,
            limit,
        } => {
            let status = status
                .map(|s| {
                    ReleaseStatus::parse(&s)
                        .with_context(|| format!("unknown release status: {s}"))
                })
                .transpose()?;
            let installer = open_installer(&config).await?;
            let releases = installer
                .list_releases(&ReleaseFilter {
                    pack_code,
                    status,
                    limit,
                })
                .await?;
            let reports: Vec<ReleaseReport> = releases.iter().map(ReleaseReport::from).collect();
            print_json(&reports)
        }
        Commands::Show { id } => {
            let installer = open_installer(&config).await?;
            let release = installer.get_release(id).await?;
            print_json(&ReleaseReport::from(&release))
        }
        Commands::Key { command } => handle_key_command(command).await,
        Commands::Bundle { command } => handle_bundle_command(command, &config).await,
    }
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::debug!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {path}");
    }

    figment
        .merge(Env::prefixed("PACKYARD_").split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn open_installer(config_path: &str) -> Result<PackInstaller> {
    let config = load_config(config_path)?;
    let store = packyard_metadata::from_config(&config.metadata)
        .await
        .context("failed to open metadata store")?;
    PackInstaller::from_config(&config, store).context("failed to initialize installer")
}

async fn handle_key_command(command: KeyCommands) -> Result<()> {
    match command {
        KeyCommands::Generate { key_id, output } => {
            let keypair = KeyPair::generate(&key_id);
            let secret_key = keypair.to_secret_key();

            if let Some(path) = output {
                tokio::fs::write(&path, format!("{secret_key}\n"))
                    .await
                    .with_context(|| format!("failed to write key to {}", path.display()))?;
                println!("Secret key written to: {}", path.display());
            } else {
                println!("Secret key:");
                println!("{secret_key}");
            }

            println!("\nAdd this to [signing.public_keys] in the installer config:");
            println!("  \"{key_id}\" = \"{}\"", keypair.public.to_base64());
        }
        KeyCommands::Public { file } => {
            let keypair = read_keypair(&file).await?;
            println!("{}", keypair.to_public_key());
        }
    }
    Ok(())
}

async fn handle_bundle_command(command: BundleCommands, config_path: &str) -> Result<()> {
    match command {
        BundleCommands::Build { dir, key_file, out } => {
            let signer = PackSigner::new(read_keypair(&key_file).await?);
            let builder = BundleBuilder::from_dir(&dir)
                .with_context(|| format!("failed to read pack source {}", dir.display()))?;
            let bytes = builder.build(&signer).context("failed to build bundle")?;
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("failed to write {}", out.display()))?;

            let manifest = builder.manifest();
            tracing::info!(
                pack = %manifest.code,
                release = %manifest.release_id,
                assets = manifest.assets.len(),
                path = %out.display(),
                "Bundle written"
            );
            print_json(&serde_json::json!({
                "pack_code": manifest.code,
                "release_id": manifest.release_id,
                "path": out,
                "sha256": packyard_core::ContentHash::compute(&bytes).to_hex(),
            }))
        }
        BundleCommands::Verify { file } => {
            let config = load_config(config_path)?;
            let keys = KeyRing::from_base64_map(&config.signing.public_keys)
                .context("invalid signing.public_keys")?;
            let source = HttpArtifactSource::new(config.install.artifact_timeout())?;
            let loader = ArtifactLoader::new(Arc::new(source), keys)
                .with_max_extracted_bytes(config.install.max_extracted_bytes);

            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let artifact = loader
                .verify(&bytes)
                .map_err(|e| anyhow::anyhow!("verification failed [{}]: {e}", e.code()))?;
            print_json(&serde_json::json!({
                "pack_code": artifact.manifest.code,
                "release_id": artifact.manifest.release_id,
                "assets": artifact.manifest.assets.len(),
                "sha256": artifact.artifact_sha256,
            }))
        }
    }
}

async fn read_keypair(path: &Path) -> Result<KeyPair> {
    let secret = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read key file: {}", path.display()))?;
    KeyPair::from_secret_key(secret.trim()).context("failed to parse secret key")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
