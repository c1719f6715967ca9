use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Reason, Result};
use crate::hashing;
use crate::locator::{ReleaseDescriptor, ReleaseLocator};
use crate::publish::{self, IndexLoad};
use crate::record::ChecksumTrust;
use crate::storage::Bucket;

/// Which cache tier satisfied the input, recorded for the Build Record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTier {
    LocalFile,
    DownloadCache,
    RemoteCache,
    Network,
}

impl SourceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceTier::LocalFile => "local-file",
            SourceTier::DownloadCache => "download-cache",
            SourceTier::RemoteCache => "remote-cache",
            SourceTier::Network => "network",
        }
    }
}

#[derive(Debug)]
pub struct ResolvedInput {
    pub path: PathBuf,
    pub filename: String,
    /// Checksum established during resolution, if any. This value is the
    /// single source of truth for the composite cache key downstream.
    pub sha256: Option<String>,
    pub trust: ChecksumTrust,
    pub tier: SourceTier,
    pub descriptor: Option<ReleaseDescriptor>,
}

#[derive(Debug)]
pub enum FetchOutcome {
    Resolved(ResolvedInput),
    /// The expected output for this release is already published and still
    /// exists remotely; the whole pipeline can be skipped before any
    /// download happens.
    AlreadyPublished { filename: String },
}

/// Resolve the input artifact through the cache tiers, cheapest exit first.
pub fn resolve(
    cfg: &Config,
    locator: &dyn ReleaseLocator,
    output_bucket: Option<&dyn Bucket>,
    cache_bucket: Option<&dyn Bucket>,
) -> Result<FetchOutcome> {
    // Tier 1: explicit local path, used verbatim. No checksum is assumed;
    // one is computed later and recorded as locally computed.
    if let Some(local) = cfg.local_file.as_deref() {
        if !local.is_file() {
            return Err(Error::tagged(
                Reason::Config,
                format!("local input file not found: {}", local.display()),
            ));
        }
        let filename = file_name_of(local)?;
        info!(path = %local.display(), "local input mode");
        return Ok(FetchOutcome::Resolved(ResolvedInput {
            path: local.to_path_buf(),
            filename,
            sha256: None,
            trust: ChecksumTrust::Computed,
            tier: SourceTier::LocalFile,
            descriptor: None,
        }));
    }

    // Tier 2: locate the latest release. Nothing found is fatal and
    // non-retryable; it means the site structure or network is broken.
    let release = locator
        .locate_latest(&cfg.device)?
        .ok_or_else(|| {
            Error::tagged(
                Reason::Locator,
                format!("no eligible release found for device '{}'", cfg.device),
            )
        })?;

    // Tier 3: Build History short-circuit. Must run before any download.
    if let Some(bucket) = output_bucket {
        if let Some(filename) = history_short_circuit(bucket, &release.filename)? {
            return Ok(FetchOutcome::AlreadyPublished { filename });
        }
    }

    // Tier 4: local download cache.
    let cached_path = cfg.output_dir.join(&release.filename);
    if cached_path.is_file() {
        if let Some(resolved) = try_local_cache(cfg, &release, &cached_path)? {
            return Ok(FetchOutcome::Resolved(resolved));
        }
    }

    // Tier 5: remote download cache bucket.
    if let Some(bucket) = cache_bucket {
        if let Some(resolved) = try_remote_cache(cfg, &release, bucket)? {
            return Ok(FetchOutcome::Resolved(resolved));
        }
    }

    // Tier 6: fresh network download.
    let resolved = download_fresh(cfg, &release, cache_bucket)?;
    Ok(FetchOutcome::Resolved(resolved))
}

fn history_short_circuit(bucket: &dyn Bucket, release_filename: &str) -> Result<Option<String>> {
    let expected = publish::output_filename_for(release_filename);
    let Some(bytes) = bucket.download_bytes(publish::HISTORY_INDEX_KEY)? else {
        return Ok(None);
    };
    let entries = match publish::parse_index(&bytes) {
        IndexLoad::Loaded(entries) => entries,
        IndexLoad::Empty => return Ok(None),
        IndexLoad::Corrupt(why) => {
            warn!(%why, "remote history index unreadable, skipping short-circuit");
            return Ok(None);
        }
    };
    let Some(entry) = entries.iter().find(|e| e.filename == expected) else {
        return Ok(None);
    };
    if entry.object.is_empty() {
        // Entry written by an older builder; cannot re-check existence.
        return Ok(None);
    }
    // The index is only trustworthy if the referenced object still exists.
    if !bucket.exists(&entry.object)? {
        warn!(object = %entry.object, "history entry points at a missing object, rebuilding");
        return Ok(None);
    }
    info!(filename = %expected, "already published, skipping build");
    Ok(Some(expected))
}

fn try_local_cache(
    cfg: &Config,
    release: &ReleaseDescriptor,
    cached_path: &Path,
) -> Result<Option<ResolvedInput>> {
    info!(path = %cached_path.display(), "found in download cache");
    if cfg.skip_hash_check {
        warn!("hash check skipped by request, trusting cached file unverified");
        return Ok(Some(ResolvedInput {
            path: cached_path.to_path_buf(),
            filename: release.filename.clone(),
            sha256: None,
            trust: ChecksumTrust::TrustedUnverified,
            tier: SourceTier::DownloadCache,
            descriptor: Some(release.clone()),
        }));
    }
    match release.sha256.as_deref() {
        Some(expected) => {
            let actual = hashing::digest_file(cached_path)?;
            if hashing::digests_match(&actual, expected) {
                info!("download cache hit, checksum verified");
                Ok(Some(ResolvedInput {
                    path: cached_path.to_path_buf(),
                    filename: release.filename.clone(),
                    sha256: Some(actual),
                    trust: ChecksumTrust::Verified,
                    tier: SourceTier::DownloadCache,
                    descriptor: Some(release.clone()),
                }))
            } else {
                // Soft miss: the cached copy is stale or damaged, fall
                // through to the next tier.
                warn!(expected, actual = %actual, "cached file checksum mismatch, re-fetching");
                Ok(None)
            }
        }
        None => {
            let actual = hashing::digest_file(cached_path)?;
            info!("download cache hit, no published checksum, computed locally");
            Ok(Some(ResolvedInput {
                path: cached_path.to_path_buf(),
                filename: release.filename.clone(),
                sha256: Some(actual),
                trust: ChecksumTrust::Computed,
                tier: SourceTier::DownloadCache,
                descriptor: Some(release.clone()),
            }))
        }
    }
}

fn try_remote_cache(
    cfg: &Config,
    release: &ReleaseDescriptor,
    bucket: &dyn Bucket,
) -> Result<Option<ResolvedInput>> {
    let dest = cfg.work_dir.join(&release.filename);
    if !bucket.download(&release.filename, &dest)? {
        return Ok(None);
    }
    info!(bucket = bucket.name(), filename = %release.filename, "remote cache hit");
    let actual = hashing::digest_file(&dest)?;
    if let Some(expected) = release.sha256.as_deref() {
        if !hashing::digests_match(&actual, expected) {
            // Stale cache object; soft miss, fall through to a fresh fetch.
            warn!(expected, actual = %actual, "remote cache checksum mismatch, re-fetching");
            return Ok(None);
        }
        return Ok(Some(ResolvedInput {
            path: dest,
            filename: release.filename.clone(),
            sha256: Some(actual),
            trust: ChecksumTrust::Verified,
            tier: SourceTier::RemoteCache,
            descriptor: Some(release.clone()),
        }));
    }
    Ok(Some(ResolvedInput {
        path: dest,
        filename: release.filename.clone(),
        sha256: Some(actual),
        trust: ChecksumTrust::Computed,
        tier: SourceTier::RemoteCache,
        descriptor: Some(release.clone()),
    }))
}

fn download_fresh(
    cfg: &Config,
    release: &ReleaseDescriptor,
    cache_bucket: Option<&dyn Bucket>,
) -> Result<ResolvedInput> {
    fs::create_dir_all(&cfg.work_dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", cfg.work_dir.display())))?;
    let dest = cfg.work_dir.join(&release.filename);
    let actual = download_to(&release.url, &dest, cfg)?;

    let trust = match release.sha256.as_deref() {
        Some(expected) => {
            if !hashing::digests_match(&actual, expected) {
                // A tampered or truncated fresh download is fatal; nothing
                // downstream may run on it.
                return Err(Error::tagged(
                    Reason::Checksum,
                    format!(
                        "checksum mismatch for {}: expected {expected}, got {actual}",
                        release.filename
                    ),
                ));
            }
            info!(filename = %release.filename, "download verified against published checksum");
            ChecksumTrust::Verified
        }
        None => {
            info!(filename = %release.filename, "no published checksum, recording computed digest");
            ChecksumTrust::Computed
        }
    };

    // Populate both download caches for future runs; failures here cost a
    // re-download later, nothing else.
    if let Some(bucket) = cache_bucket {
        if let Err(e) = bucket.upload(&dest, &release.filename) {
            warn!(error = %e, "failed to populate remote download cache");
        }
    }
    let local_copy = cfg.output_dir.join(&release.filename);
    if local_copy != dest {
        if let Err(e) = fs::create_dir_all(&cfg.output_dir)
            .and_then(|_| fs::copy(&dest, &local_copy).map(|_| ()))
        {
            warn!(error = %e, "failed to populate local download cache");
        }
    }

    Ok(ResolvedInput {
        path: dest,
        filename: release.filename.clone(),
        sha256: Some(actual),
        trust,
        tier: SourceTier::Network,
        descriptor: Some(release.clone()),
    })
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Stream the download to disk, hashing as bytes arrive. The file lands via
/// temp-file-and-rename so a killed run never leaves a plausible-looking
/// partial artifact at the final path.
fn download_to(url: &str, dest: &Path, cfg: &Config) -> Result<String> {
    info!(%url, dest = %dest.display(), "starting download");
    let client = reqwest::blocking::Client::builder()
        .timeout(cfg.network_timeout)
        .build()
        .map_err(|e| Error::tagged(Reason::Download, format!("failed to build HTTP client: {e}")))?;
    let mut res = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::tagged(Reason::Download, format!("download failed: {e}")))?;

    let parent = dest
        .parent()
        .ok_or_else(|| Error::msg(format!("invalid destination {}", dest.display())))?;
    let staging = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::msg(format!("failed to stage download: {e}")))?;
    let mut writer = HashingWriter {
        inner: std::io::BufWriter::new(staging.reopen().map_err(|e| {
            Error::msg(format!("failed to open staging file: {e}"))
        })?),
        hasher: Sha256::new(),
    };
    res.copy_to(&mut writer)
        .map_err(|e| Error::tagged(Reason::Download, format!("download stream failed: {e}")))?;
    writer
        .flush()
        .map_err(|e| Error::msg(format!("failed to flush download: {e}")))?;
    let digest = hex::encode(writer.hasher.finalize());
    staging
        .persist(dest)
        .map_err(|e| Error::msg(format!("failed to persist download {}: {e}", dest.display())))?;
    info!(sha256 = %digest, "download complete");
    Ok(digest)
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::msg(format!("path has no filename: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, OutputShape};
    use crate::storage::DirBucket;
    use std::time::Duration;

    fn test_config(root: &Path) -> Config {
        Config {
            device: "frankel".into(),
            output_bucket: None,
            cache_bucket: None,
            project: None,
            work_dir: root.join("work"),
            output_dir: root.join("output"),
            key_name: "k.pem".into(),
            secret_dir: root.join("secrets"),
            app_dir: root.join("app"),
            scraper_cmd: "true".into(),
            avb_passphrase: None,
            network_timeout: Duration::from_secs(5),
            tool_timeout: Duration::from_secs(5),
            local_file: None,
            local_key: None,
            skip_hash_check: false,
            shape: OutputShape::Full,
            fast_compression: false,
        }
    }

    struct StaticLocator(Option<ReleaseDescriptor>);

    impl ReleaseLocator for StaticLocator {
        fn locate_latest(&self, _device: &str) -> Result<Option<ReleaseDescriptor>> {
            Ok(self.0.clone())
        }
    }

    fn release(filename: &str, sha256: Option<String>) -> ReleaseDescriptor {
        ReleaseDescriptor {
            device: "frankel".into(),
            url: format!("https://dl.example/{filename}"),
            filename: filename.into(),
            sha256,
        }
    }

    #[test]
    fn locator_returning_nothing_is_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(tmp.path());
        let err = resolve(&cfg, &StaticLocator(None), None, None).expect_err("must fail");
        assert_eq!(err.reason(), Reason::Locator);
    }

    #[test]
    fn local_cache_hit_with_matching_checksum() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(tmp.path());
        std::fs::create_dir_all(&cfg.output_dir).expect("mkdir");
        std::fs::write(cfg.output_dir.join("build-123.zip"), b"bytes").expect("write");
        let sha = hashing::digest_string("bytes");

        let locator = StaticLocator(Some(release("build-123.zip", Some(sha.clone()))));
        let out = resolve(&cfg, &locator, None, None).expect("resolve");
        let FetchOutcome::Resolved(input) = out else {
            panic!("expected resolved input");
        };
        assert_eq!(input.tier, SourceTier::DownloadCache);
        assert_eq!(input.trust, ChecksumTrust::Verified);
        assert_eq!(input.sha256.as_deref(), Some(sha.as_str()));
    }

    #[test]
    fn skip_hash_check_is_recorded_as_trusted_unverified() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = test_config(tmp.path());
        cfg.skip_hash_check = true;
        std::fs::create_dir_all(&cfg.output_dir).expect("mkdir");
        std::fs::write(cfg.output_dir.join("build-123.zip"), b"bytes").expect("write");

        let locator = StaticLocator(Some(release("build-123.zip", Some("0".repeat(64)))));
        let out = resolve(&cfg, &locator, None, None).expect("resolve");
        let FetchOutcome::Resolved(input) = out else {
            panic!("expected resolved input");
        };
        assert_eq!(input.trust, ChecksumTrust::TrustedUnverified);
        assert!(input.sha256.is_none());
    }

    #[test]
    fn stale_local_cache_falls_through_to_remote_cache() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(tmp.path());
        std::fs::create_dir_all(&cfg.output_dir).expect("mkdir");
        // Cached copy has the wrong content.
        std::fs::write(cfg.output_dir.join("build-123.zip"), b"stale").expect("write");

        let good = b"good bytes";
        let sha = hashing::digest_string("good bytes");
        let cache = DirBucket::new("cache", tmp.path().join("cache-bucket"));
        cache.upload_bytes(good, "build-123.zip").expect("seed");

        let locator = StaticLocator(Some(release("build-123.zip", Some(sha))));
        let out = resolve(&cfg, &locator, None, Some(&cache)).expect("resolve");
        let FetchOutcome::Resolved(input) = out else {
            panic!("expected resolved input");
        };
        assert_eq!(input.tier, SourceTier::RemoteCache);
        assert_eq!(input.trust, ChecksumTrust::Verified);
        assert_eq!(std::fs::read(&input.path).expect("read"), good);
    }

    #[test]
    fn history_short_circuit_requires_existing_object() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(tmp.path());
        let bucket = DirBucket::new("out", tmp.path().join("out-bucket"));

        let mut entry = publish::entry_for(
            "frankel",
            "ksu_patched_build-123.zip",
            "https://example/x",
            "builds/frankel/20250805/ksu_patched_build-123.zip",
        );
        entry.timestamp = "2025-08-05T00:00:00Z".into();
        let index = serde_json::to_vec(&vec![entry.clone()]).expect("json");
        bucket
            .upload_bytes(&index, publish::HISTORY_INDEX_KEY)
            .expect("seed");

        let locator = StaticLocator(Some(release("build-123.zip", None)));

        // Index entry exists but the object is gone: no short-circuit, and
        // with no caches or network the local-cache path is simply absent,
        // so resolution proceeds to a (failing) download attempt.
        assert!(matches!(
            history_short_circuit(&bucket, "build-123.zip").expect("check"),
            None
        ));

        // Now the object exists: clean short-circuit.
        bucket.upload_bytes(b"zip", &entry.object).expect("seed");
        let out = resolve(&cfg, &locator, Some(&bucket), None).expect("resolve");
        assert!(matches!(
            out,
            FetchOutcome::AlreadyPublished { filename } if filename == "ksu_patched_build-123.zip"
        ));
    }

    #[test]
    fn missing_local_override_is_fatal_config() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = test_config(tmp.path());
        cfg.local_file = Some(tmp.path().join("missing.zip"));
        let err = resolve(&cfg, &StaticLocator(None), None, None).expect_err("must fail");
        assert_eq!(err.reason(), Reason::Config);
    }
}
