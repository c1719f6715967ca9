use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Config;
use crate::error::{Error, Reason, Result};
use crate::hashing;
use crate::storage::Bucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    CliOverride,
    MountedSecret,
    AppDir,
    WorkingDir,
    RemoteBlob,
}

impl KeySource {
    pub fn as_str(self) -> &'static str {
        match self {
            KeySource::CliOverride => "cli-override",
            KeySource::MountedSecret => "mounted-secret",
            KeySource::AppDir => "app-dir",
            KeySource::WorkingDir => "working-dir",
            KeySource::RemoteBlob => "remote-blob",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub path: PathBuf,
    /// Content hash, computed exactly once per run; half of every composite
    /// cache key.
    pub hash: String,
    pub source: KeySource,
}

/// Resolve the signing key. The search order is a compatibility contract:
/// reordering it silently changes which key signs a build.
///
/// 1. explicit `--local-key` path (missing file is fatal, no fallback)
/// 2. mounted-secret copy under `secret_dir`
/// 3. application-directory copy under `app_dir`
/// 4. working-directory copy
/// 5. remote key blob `keys/<name>` in the output bucket
pub fn resolve_signing_key(cfg: &Config, bucket: Option<&dyn Bucket>) -> Result<ResolvedKey> {
    if let Some(user_path) = cfg.local_key.as_deref() {
        if !user_path.is_file() {
            return Err(Error::tagged(
                Reason::Key,
                format!("signing key not found at {}", user_path.display()),
            ));
        }
        return finish(user_path.to_path_buf(), KeySource::CliOverride);
    }

    let candidates = [
        (cfg.secret_dir.join(&cfg.key_name), KeySource::MountedSecret),
        (cfg.app_dir.join(&cfg.key_name), KeySource::AppDir),
        (cfg.work_dir.join(&cfg.key_name), KeySource::WorkingDir),
    ];
    for (path, source) in candidates {
        if path.is_file() {
            return finish(path, source);
        }
    }

    if let Some(bucket) = bucket {
        let blob = format!("keys/{}", cfg.key_name);
        let dest = cfg.work_dir.join(&cfg.key_name);
        info!(bucket = bucket.name(), %blob, "key not found locally, fetching from bucket");
        match bucket.download(&blob, &dest) {
            Ok(true) => return finish(dest, KeySource::RemoteBlob),
            Ok(false) => {}
            Err(e) => {
                return Err(Error::tagged(
                    Reason::Key,
                    format!("failed to fetch signing key {blob}: {e}"),
                ));
            }
        }
    }

    Err(Error::tagged(
        Reason::Key,
        format!("signing key '{}' not found in any candidate location", cfg.key_name),
    ))
}

fn finish(path: PathBuf, source: KeySource) -> Result<ResolvedKey> {
    let hash = hashing::digest_file(&path).map_err(|e| e.with_reason(Reason::Key))?;
    info!(key = %path.display(), source = source.as_str(), "signing key resolved");
    Ok(ResolvedKey { path, hash, source })
}

/// Certificate filename derived from the key filename.
pub fn cert_name_for(key_path: &Path) -> String {
    let base = key_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "signing_key".to_string());
    for ext in [".pem", ".key"] {
        if let Some(stem) = base.strip_suffix(ext) {
            return format!("{stem}.crt");
        }
    }
    format!("{base}.crt")
}
