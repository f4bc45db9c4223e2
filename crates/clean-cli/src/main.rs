use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clean_platforms::fingerprint;
use clean_storage::{Cache, HttpFetcher, RequestOptions};
use clean_sync::{cached_folder_ids, HarvestConfig, Harvester};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "clean-scraper")]
#[command(about = "Harvest file metadata from public-records portals")]
struct Cli {
    /// Cache directory (defaults to $CLEAN_ETL_DIR/cache)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Log level used when RUST_LOG is unset
    #[arg(long, short = 'l', global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and normalize one or more portal folders
    Harvest {
        /// Cache subdirectory for the merged folder JSON, e.g. ca_bart/subpages
        #[arg(long)]
        subdir: PathBuf,
        #[arg(long)]
        force: bool,
        /// Seconds to wait between requests
        #[arg(long)]
        throttle: Option<u64>,
        /// Write records to {exports}/{name}.json
        #[arg(long)]
        export: Option<String>,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Show how a portal URL would be fetched
    Fingerprint { url: String },
    /// List folder ids already in the cache
    Cached {
        #[arg(long)]
        subdir: PathBuf,
    },
    /// Download a URL into the cache unless already present
    Download {
        /// Cache-relative destination
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        url: String,
        #[arg(long)]
        force: bool,
        /// Extra request header as NAME:VALUE, repeatable
        #[arg(long = "header")]
        headers: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = HarvestConfig::from_env();
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }

    match cli.command {
        Commands::Harvest {
            subdir,
            force,
            throttle,
            export,
            urls,
        } => {
            let harvester = Harvester::from_config(&config)?;
            let throttle = throttle
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.throttle());
            let summary = harvester.harvest_folders(&subdir, &urls, force, throttle).await;
            if let Some(name) = export {
                let exports = Cache::new(config.exports_dir.clone());
                let path = exports
                    .write_json(format!("{name}.json"), &summary.records)
                    .await?;
                println!("exported {} records to {}", summary.records.len(), path.display());
            }
            println!(
                "harvest complete: run_id={} folders={} fetched={} cached={} failed={} records={}",
                summary.run_id,
                summary.folders,
                summary.fetched,
                summary.cached,
                summary.failed,
                summary.records.len()
            );
        }
        Commands::Fingerprint { url } => {
            let profile = fingerprint(&url)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Commands::Cached { subdir } => {
            let cache = Cache::new(config.cache_dir.clone());
            for folder_id in cached_folder_ids(&cache, &subdir)? {
                println!("{folder_id}");
            }
        }
        Commands::Download {
            path,
            url,
            force,
            headers,
        } => {
            let mut options = RequestOptions::default();
            for header in &headers {
                let (name, value) = header
                    .split_once(':')
                    .with_context(|| format!("header {header:?} is not NAME:VALUE"))?;
                options = options.with_header(name.trim(), value.trim());
            }
            let http = HttpFetcher::new(config.http_client_config())?;
            let cache = Cache::new(config.cache_dir.clone());
            let local = cache.download(&http, &path, &url, force, &options).await?;
            println!("{}", local.display());
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
