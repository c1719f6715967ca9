use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ota_forge::config::{CliOverrides, Config};
use ota_forge::locator::ScraperLocator;
use ota_forge::metrics::{CloudLoggingMetrics, MetricSink, NoopMetrics};
use ota_forge::patch::AvbRootPatcher;
use ota_forge::pipeline::{self, Deps, Outcome};
use ota_forge::storage::{Bucket, GcsBucket};

/// Fetch the latest vendor firmware release, re-sign it with a custom root
/// patch, and publish the result with an update-discovery index.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Use a local firmware zip instead of locating the latest release
    #[arg(long)]
    local_file: Option<PathBuf>,
    /// Use an explicit signing key path instead of the search order
    #[arg(long)]
    local_key: Option<PathBuf>,
    /// Trust a cached local file without re-verifying its checksum
    #[arg(long)]
    skip_hash_check: bool,
    /// Produce only the raw patched init_boot.img (fastest)
    #[arg(long, conflicts_with = "minimal")]
    raw_output: bool,
    /// Also produce a minimal zip containing only the modified images
    #[arg(long)]
    minimal: bool,
    /// Use store-mode (no) compression for generated packages
    #[arg(long)]
    fast: bool,
}

fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cli = CliOverrides {
        local_file: args.local_file,
        local_key: args.local_key,
        skip_hash_check: args.skip_hash_check,
        raw_output: args.raw_output,
        minimal: args.minimal,
        fast: args.fast,
    };
    let cfg = match Config::from_env(cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(reason = e.reason().as_str(), "invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let deps = build_deps(&cfg);
    match pipeline::run(&cfg, &deps) {
        Ok(Outcome::Built { output }) => {
            info!(%output, "build complete");
        }
        Ok(Outcome::SkippedCacheHit { output }) => {
            info!(%output, "skipped: output already built for this input and key");
        }
        Ok(Outcome::SkippedHistoryHit { output }) => {
            info!(%output, "skipped: output already published");
        }
        Err(e) => {
            error!(reason = e.reason().as_str(), "build failed: {e}");
            std::process::exit(1);
        }
    }
}

fn build_deps(cfg: &Config) -> Deps {
    let output_bucket: Option<Box<dyn Bucket>> = cfg
        .output_bucket
        .as_deref()
        .map(|name| Box::new(GcsBucket::new(name, cfg.network_timeout)) as Box<dyn Bucket>);
    let cache_bucket: Option<Box<dyn Bucket>> = cfg
        .cache_bucket
        .as_deref()
        .map(|name| Box::new(GcsBucket::new(name, cfg.network_timeout)) as Box<dyn Bucket>);
    let metrics: Box<dyn MetricSink> = match cfg.project.as_deref() {
        Some(project) => Box::new(CloudLoggingMetrics {
            project: project.to_string(),
            timeout: Duration::from_secs(30),
        }),
        None => Box::new(NoopMetrics),
    };

    Deps {
        locator: Box::new(ScraperLocator {
            command: cfg.scraper_cmd.clone(),
            timeout: cfg.network_timeout,
        }),
        patcher: Box::new(AvbRootPatcher::new(
            cfg.work_dir.join("certs"),
            cfg.avb_passphrase.clone(),
            cfg.tool_timeout,
        )),
        output_bucket,
        cache_bucket,
        metrics,
    }
}
