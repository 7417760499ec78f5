//! Fee Sponsor CLI
//!
//! - `build --request <file.json>`: fetch instructions and print an unsigned draft (base64)
//! - `cosign --tx <base64>`: validate, co-sign, broadcast and confirm a user-signed draft
//! - `serve-metrics`: serve the Prometheus endpoint until interrupted


// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use fee_sponsor::config::Config;
use fee_sponsor::endpoints;
use fee_sponsor::pipeline::ceremony::CustodialSigner;
use fee_sponsor::pipeline::flows::{RequestSpec, SourceFactory};
use fee_sponsor::pipeline::{
    OperationError, PacingClock, PipelineConfig, RpcChainClient, SharedCaches, SponsorPipeline,
};
use fee_sponsor::pipeline::issued::IssuedDrafts;
use fee_sponsor::pipeline::lookup_tables::LookupTableCache;
use fee_sponsor::pipeline::recency::RecencyRegistry;
use fee_sponsor::signer::{HttpCustodialSigner, KeypairSigner};
use fee_sponsor::wallet::SponsorWallet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an unsigned, sponsor-paid draft
    Build {
        /// Operation request (JSON)
        #[arg(long)]
        request: PathBuf,
    },
    /// Co-sign and send a user-signed draft
    Cosign {
        /// User-signed transaction, base64
        #[arg(long)]
        tx: String,
    },
    /// Serve the metrics endpoint only
    ServeMetrics,
}

impl Command {
    /// Long-running commands that expose the metrics endpoint
    fn serves_metrics(&self) -> bool {
        matches!(self, Self::ServeMetrics)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.json_logs)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting fee sponsor");

    let config = load_config(&args.config)?;
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    if config.monitoring.enable_metrics && args.command.serves_metrics() {
        let listener = endpoints::bind(config.monitoring.metrics_port).await?;
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(listener, shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    match args.command {
        Command::Build { request } => {
            let pipeline = build_pipeline(&config)?;
            let spec: RequestSpec = serde_json::from_slice(
                &std::fs::read(&request)
                    .with_context(|| format!("Failed to read request {}", request.display()))?,
            )
            .context("Failed to parse request")?;
            let factory = SourceFactory::new(
                config.providers.endpoints.clone(),
                Arc::new(PacingClock::new(Duration::from_millis(config.providers.min_interval_ms))),
                Duration::from_secs(config.providers.timeout_secs),
                config.retry_config(),
            );
            let request = spec.into_request(&factory).map_err(report)?;
            let draft = pipeline
                .build_draft(request.sources(), &cancel)
                .await
                .map_err(report)?;
            println!("{}", draft.to_base64());
        }
        Command::Cosign { tx } => {
            let pipeline = build_pipeline(&config)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(tx.trim())
                .context("--tx is not valid base64")?;
            let result = pipeline
                .cosign_and_send(&bytes, &cancel, &())
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::ServeMetrics => {
            if !config.monitoring.enable_metrics {
                bail!("metrics are disabled in the configuration");
            }
            cancel.cancelled().await;
        }
    }

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let default_filter = if verbose {
        "fee_sponsor=debug,info"
    } else {
        "fee_sponsor=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file_with_env(path).with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!("Config file '{}' not found, using defaults", path);
        dotenvy::dotenv().ok();
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }
}

fn build_pipeline(config: &Config) -> Result<SponsorPipeline> {
    let configured = config.sponsor_pubkey()?;

    let (sponsor, signer) = match &config.sponsor.signer_url {
        Some(url) => {
            let Some(sponsor) = configured else {
                bail!("sponsor.pubkey is required with a signing service");
            };
            let signer: Arc<dyn CustodialSigner> = Arc::new(HttpCustodialSigner::new(
                url.clone(),
                config.sponsor.signer_api_key.clone(),
                Duration::from_secs(config.sponsor.signer_timeout_secs),
            )?);
            (sponsor, signer)
        }
        None => {
            let path = config
                .sponsor
                .keypair_path
                .as_deref()
                .context("sponsor.keypair_path is required without a signing service")?;
            let wallet = SponsorWallet::from_file(path)?;
            if let Some(expected) = configured {
                if expected != wallet.pubkey() {
                    bail!("keypair {} does not match sponsor.pubkey {}", wallet.pubkey(), expected);
                }
            }
            let sponsor = wallet.pubkey();
            let signer: Arc<dyn CustodialSigner> =
                Arc::new(KeypairSigner::new(config.sponsor.key_id.clone(), wallet));
            (sponsor, signer)
        }
    };
    info!(%sponsor, "Sponsor account");

    let chain = Arc::new(RpcChainClient::new(
        config.rpc.url.clone(),
        config.commitment()?,
        config.rpc_timeout(),
    ));
    let caches = SharedCaches {
        lookup_tables: Arc::new(LookupTableCache::new(Duration::from_secs(
            config.composer.lookup_table_ttl_secs,
        ))),
        recency: Arc::new(RecencyRegistry::new(Duration::from_secs(
            config.composer.recency_ttl_secs,
        ))),
        issued: Arc::new(IssuedDrafts::new(Duration::from_secs(
            config.composer.recency_ttl_secs,
        ))),
    };

    let mut pipeline_config = PipelineConfig::new(sponsor, config.sponsor.key_id.clone());
    pipeline_config.composer = config.composer_config();
    pipeline_config.broadcast = config.broadcast_config();
    pipeline_config.retry = config.retry_config();
    pipeline_config.require_issued_draft = config.sponsor.require_issued_draft;
    if !pipeline_config.require_issued_draft {
        info!("Co-signing messages not drafted by this process; sponsored creates stay capped");
    }

    Ok(SponsorPipeline::new(pipeline_config, chain, signer, caches))
}

/// Print the user-facing message for a failed operation
fn report(err: OperationError) -> anyhow::Error {
    eprintln!("{}", err.user_message());
    anyhow::Error::new(err)
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            cancel.cancel();
        }
    });
}
