use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Reason, Result};

pub const DEFAULT_DEVICE: &str = "frankel";
pub const DEFAULT_KEY_NAME: &str = "cyber_rsa4096_private.pem";
pub const DEFAULT_SCRAPER_CMD: &str = "factory-scraper";

/// Shape of the deliverable produced alongside the signed update zip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// The full flashable update zip (default).
    Full,
    /// An extra zip containing only the modified image files.
    Minimal,
    /// No repackaging; the raw patched init_boot.img is the deliverable.
    Raw,
}

/// CLI-sourced overrides, separated from env resolution so tests can build a
/// `Config` without touching the process environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub local_file: Option<PathBuf>,
    pub local_key: Option<PathBuf>,
    pub skip_hash_check: bool,
    pub raw_output: bool,
    pub minimal: bool,
    pub fast: bool,
}

/// Immutable run configuration. Constructed once at startup; the environment
/// is never re-read mid-run.
#[derive(Debug, Clone)]
pub struct Config {
    pub device: String,
    pub output_bucket: Option<String>,
    pub cache_bucket: Option<String>,
    pub project: Option<String>,
    /// Scratch directory for this run (downloads, patched output, certs).
    pub work_dir: PathBuf,
    /// Durable local output directory: download cache, Build Record, local index.
    pub output_dir: PathBuf,
    pub key_name: String,
    pub secret_dir: PathBuf,
    pub app_dir: PathBuf,
    pub scraper_cmd: String,
    pub avb_passphrase: Option<String>,
    pub network_timeout: Duration,
    pub tool_timeout: Duration,
    pub local_file: Option<PathBuf>,
    pub local_key: Option<PathBuf>,
    pub skip_hash_check: bool,
    pub shape: OutputShape,
    pub fast_compression: bool,
}

fn env_first(names: &[&str]) -> Option<String> {
    for name in names {
        if let Ok(v) = std::env::var(name) {
            let v = v.trim().to_string();
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    None
}

impl Config {
    pub fn from_env(cli: CliOverrides) -> Result<Self> {
        if cli.raw_output && cli.minimal {
            return Err(Error::tagged(
                Reason::Config,
                "--raw-output and --minimal are mutually exclusive",
            ));
        }
        let shape = if cli.raw_output {
            OutputShape::Raw
        } else if cli.minimal {
            OutputShape::Minimal
        } else {
            OutputShape::Full
        };

        let work_dir = env_first(&["OTA_WORK_DIR"])
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let output_dir = env_first(&["OTA_OUTPUT_DIR"])
            .map(PathBuf::from)
            .unwrap_or_else(|| work_dir.join("output"));

        Ok(Self {
            device: env_first(&["DEVICE_CODENAME", "_DEVICE_CODENAME"])
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            output_bucket: env_first(&["BUCKET_NAME", "_BUCKET_NAME"]),
            cache_bucket: env_first(&["CACHE_BUCKET_NAME", "_CACHE_BUCKET_NAME"]),
            project: env_first(&["GCP_PROJECT", "GOOGLE_CLOUD_PROJECT"]),
            work_dir,
            output_dir,
            key_name: env_first(&["OTA_KEY_NAME"]).unwrap_or_else(|| DEFAULT_KEY_NAME.to_string()),
            secret_dir: env_first(&["OTA_SECRET_DIR"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/secrets")),
            app_dir: env_first(&["OTA_APP_DIR"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/app")),
            scraper_cmd: env_first(&["OTA_SCRAPER_CMD"])
                .unwrap_or_else(|| DEFAULT_SCRAPER_CMD.to_string()),
            avb_passphrase: env_first(&["AVB_PASSPHRASE", "AVBROOT_PASSPHRASE"]),
            network_timeout: Duration::from_secs(
                parse_secs_env("OTA_NETWORK_TIMEOUT_SECS")?.unwrap_or(600),
            ),
            tool_timeout: Duration::from_secs(
                parse_secs_env("OTA_TOOL_TIMEOUT_SECS")?.unwrap_or(1800),
            ),
            local_file: cli.local_file,
            local_key: cli.local_key,
            skip_hash_check: cli.skip_hash_check,
            shape,
            fast_compression: cli.fast,
        })
    }

    /// Path of the persisted Build Record (one per output directory).
    pub fn record_path(&self) -> PathBuf {
        self.output_dir.join("build_status.json")
    }

    /// Path of the local build history index.
    pub fn local_index_path(&self) -> PathBuf {
        self.output_dir.join("builds_index.json")
    }

    pub fn local_latest_path(&self) -> PathBuf {
        self.output_dir.join("latest.json")
    }
}

fn parse_secs_env(name: &str) -> Result<Option<u64>> {
    let Some(raw) = env_first(&[name]) else {
        return Ok(None);
    };
    raw.parse::<u64>().map(Some).map_err(|e| {
        Error::tagged(
            Reason::Config,
            format!("invalid {name} value '{raw}': {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_and_minimal_are_mutually_exclusive() {
        let cli = CliOverrides {
            raw_output: true,
            minimal: true,
            ..Default::default()
        };
        let err = Config::from_env(cli).expect_err("must reject");
        assert_eq!(err.reason(), Reason::Config);
    }

    #[test]
    fn shape_follows_cli_flags() {
        let cfg = Config::from_env(CliOverrides {
            raw_output: true,
            ..Default::default()
        })
        .expect("config");
        assert_eq!(cfg.shape, OutputShape::Raw);

        let cfg = Config::from_env(CliOverrides::default()).expect("config");
        assert_eq!(cfg.shape, OutputShape::Full);
    }
}
