use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Reason, Result};
use crate::process::{command_summary, run_with_deadline};

/// Latest eligible upstream release for a device. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub device: String,
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Release Locator seam. The page-scraping mechanics live behind it; the
/// pipeline only cares about "latest release or none".
pub trait ReleaseLocator: Send + Sync {
    fn locate_latest(&self, device: &str) -> Result<Option<ReleaseDescriptor>>;
}

/// Production adapter: runs an external headless-scraper command that prints
/// a single JSON object `{url, filename?, sha256?}` on stdout, or `null` when
/// no eligible release was found.
pub struct ScraperLocator {
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ScrapedRelease {
    url: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

impl ReleaseLocator for ScraperLocator {
    fn locate_latest(&self, device: &str) -> Result<Option<ReleaseDescriptor>> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--device").arg(device);
        let out = run_with_deadline(cmd, self.timeout)
            .map_err(|e| e.with_reason(Reason::Locator))?;
        if !out.success {
            return Err(Error::tagged(
                Reason::Locator,
                format!("release scraper failed: {}", command_summary(&out)),
            ));
        }

        let raw = out.stdout.trim();
        if raw.is_empty() || raw == "null" {
            return Ok(None);
        }
        let scraped: ScrapedRelease = serde_json::from_str(raw).map_err(|e| {
            Error::tagged(Reason::Locator, format!("invalid scraper output: {e}"))
        })?;
        let Some(desc) = descriptor_from(device, scraped) else {
            return Ok(None);
        };
        info!(url = %desc.url, filename = %desc.filename, "release located");
        Ok(Some(desc))
    }
}

fn descriptor_from(device: &str, scraped: ScrapedRelease) -> Option<ReleaseDescriptor> {
    let url = scraped.url.trim().to_string();
    if url.is_empty() {
        return None;
    }
    let filename = scraped
        .filename
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .or_else(|| {
            url.rsplit('/')
                .next()
                .map(str::to_string)
                .filter(|f| !f.is_empty())
        })?;
    let sha256 = scraped
        .sha256
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()));
    Some(ReleaseDescriptor {
        device: device.to_string(),
        url,
        filename,
        sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scraped(url: &str, filename: Option<&str>, sha: Option<&str>) -> ScrapedRelease {
        ScrapedRelease {
            url: url.into(),
            filename: filename.map(Into::into),
            sha256: sha.map(Into::into),
        }
    }

    #[test]
    fn filename_falls_back_to_url_basename() {
        let d = descriptor_from(
            "frankel",
            scraped("https://dl.example/x/frankel-build-123.zip", None, None),
        )
        .expect("descriptor");
        assert_eq!(d.filename, "frankel-build-123.zip");
        assert!(d.sha256.is_none());
    }

    #[test]
    fn malformed_sha_is_dropped_not_fatal() {
        let d = descriptor_from(
            "frankel",
            scraped("https://dl.example/a.zip", Some("a.zip"), Some("nope")),
        )
        .expect("descriptor");
        assert!(d.sha256.is_none());

        let good = "A".repeat(64);
        let d = descriptor_from(
            "frankel",
            scraped("https://dl.example/a.zip", Some("a.zip"), Some(&good)),
        )
        .expect("descriptor");
        assert_eq!(d.sha256.as_deref(), Some("a".repeat(64).as_str()));
    }

    #[test]
    fn empty_url_means_no_release() {
        assert!(descriptor_from("frankel", scraped("  ", None, None)).is_none());
    }
}
