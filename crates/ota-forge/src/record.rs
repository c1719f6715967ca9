use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const RECORD_SCHEMA: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    #[default]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    LocalFile,
    #[default]
    AutoDownload,
}

/// How the recorded input checksum was established. `TrustedUnverified` is
/// the explicit marker for `--skip-hash-check`; it is never conflated with
/// a verified download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumTrust {
    /// Matched the upstream-published checksum.
    Verified,
    /// No published checksum was available; computed locally.
    #[default]
    Computed,
    /// Verification explicitly skipped by the caller.
    TrustedUnverified,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BuildMeta {
    pub device: String,
    pub date: String,
    pub status: BuildStatus,
    pub last_successful_build: Option<String>,
    pub mode: SourceMode,
    pub from_cache: bool,
    pub key_hash: String,
    pub work_area_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InputInfo {
    pub filename: String,
    pub sha256: String,
    pub trust: ChecksumTrust,
    pub upstream_signature_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutputInfo {
    pub filename: String,
    pub sha256: String,
    pub csig: Option<String>,
    /// Extra raw/minimal deliverable path, when that shape was requested.
    pub shape_artifact: Option<String>,
    pub flash_command: String,
    pub signed_by: String,
}

/// The persisted Build Record. Exactly one exists per output directory at a
/// time (last-write-wins); it is not an append log.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BuildRecord {
    pub schema: u32,
    pub build_meta: BuildMeta,
    pub input: InputInfo,
    pub output: OutputInfo,
}

/// Load result keeps "no record" and "record unreadable" distinguishable so
/// logs and tests can tell a first run from a corrupt file.
#[derive(Debug)]
pub enum RecordLoad {
    Loaded(BuildRecord),
    Absent,
    Corrupt(String),
}

pub fn load(path: &Path) -> RecordLoad {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return RecordLoad::Absent,
        Err(e) => return RecordLoad::Corrupt(format!("read failed: {e}")),
    };
    let record: BuildRecord = match serde_json::from_str(&data) {
        Ok(record) => record,
        Err(e) => return RecordLoad::Corrupt(format!("parse failed: {e}")),
    };
    if record.schema != RECORD_SCHEMA {
        return RecordLoad::Corrupt(format!("unsupported schema {}", record.schema));
    }
    RecordLoad::Loaded(record)
}

/// Write atomically (temp file + rename) so a killed run never leaves a
/// half-written record behind.
pub fn store(path: &Path, record: &BuildRecord) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::msg(format!("record path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    let json = serde_json::to_string_pretty(record)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::msg(format!("failed to stage record: {e}")))?;
    fs::write(tmp.path(), json)
        .map_err(|e| Error::msg(format!("failed to write record: {e}")))?;
    tmp.persist(path)
        .map_err(|e| Error::msg(format!("failed to persist record {}: {e}", path.display())))?;
    Ok(())
}
