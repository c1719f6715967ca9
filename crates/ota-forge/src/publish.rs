use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Reason, Result};
use crate::storage::Bucket;

pub const HISTORY_INDEX_KEY: &str = "builds_index.json";
pub const LATEST_POINTER_KEY: &str = "latest.json";
pub const INDEX_SCHEMA: u32 = 1;

const MAX_UPLOAD_WORKERS: usize = 4;

/// One published build. Field names are a compatibility contract with
/// external update-discovery clients; do not rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub device: String,
    pub android_version: String,
    pub build_date: String,
    pub filename: String,
    pub url: String,
    /// Bucket object key; used for existence re-checks. Absent in entries
    /// written by older builders.
    #[serde(default)]
    pub object: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryIndex {
    schema: u32,
    builds: Vec<HistoryEntry>,
}

/// Machine-readable "latest" pointer for update clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestPointer {
    pub schema: u32,
    pub date: String,
    pub build_id: String,
    pub asset_url: String,
}

/// Index load result. "Was empty" and "could not be read" stay separate so
/// the fallback to an empty index is visible in logs and tests.
#[derive(Debug)]
pub enum IndexLoad {
    Loaded(Vec<HistoryEntry>),
    Empty,
    Corrupt(String),
}

impl IndexLoad {
    /// Fallback used by read-modify-write maintenance: anything unreadable
    /// is treated as empty after being logged by the caller.
    pub fn into_entries(self) -> Vec<HistoryEntry> {
        match self {
            IndexLoad::Loaded(entries) => entries,
            IndexLoad::Empty | IndexLoad::Corrupt(_) => Vec::new(),
        }
    }
}

/// Output naming scheme; also the key the Build History short-circuit checks.
pub fn output_filename_for(input_filename: &str) -> String {
    let base = Path::new(input_filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| input_filename.to_string());
    format!("ksu_patched_{base}")
}

/// Extract the upstream build id (e.g. `bp2a.250805.005`) from a release
/// filename.
pub fn build_id_from_filename(filename: &str) -> Option<String> {
    static BUILD_ID_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = BUILD_ID_RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b([a-z][a-z0-9]{3}\.\d{6}\.\d{3}[a-z0-9]*)\b")
            .expect("pattern must compile")
    });
    re.captures(filename).map(|c| c[1].to_ascii_lowercase())
}

fn build_date_from_id(build_id: &str) -> Option<String> {
    let digits = build_id.split('.').nth(1)?;
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!(
        "20{}-{}-{}",
        &digits[0..2],
        &digits[2..4],
        &digits[4..6]
    ))
}

pub fn entry_for(device: &str, filename: &str, url: &str, object: &str) -> HistoryEntry {
    let build_id = build_id_from_filename(filename).unwrap_or_default();
    let build_date = build_date_from_id(&build_id).unwrap_or_default();
    HistoryEntry {
        device: device.to_string(),
        android_version: build_id,
        build_date,
        filename: filename.to_string(),
        url: url.to_string(),
        object: object.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

/// Parse a history index document. Accepts both the wrapped form written by
/// this builder and the bare array written by older ones.
pub fn parse_index(bytes: &[u8]) -> IndexLoad {
    if bytes.is_empty() {
        return IndexLoad::Empty;
    }
    if let Ok(index) = serde_json::from_slice::<HistoryIndex>(bytes) {
        return IndexLoad::Loaded(index.builds);
    }
    match serde_json::from_slice::<Vec<HistoryEntry>>(bytes) {
        Ok(entries) => IndexLoad::Loaded(entries),
        Err(e) => IndexLoad::Corrupt(e.to_string()),
    }
}

fn render_index(builds: Vec<HistoryEntry>) -> Result<Vec<u8>> {
    let doc = HistoryIndex {
        schema: INDEX_SCHEMA,
        builds,
    };
    Ok(serde_json::to_vec_pretty(&doc)?)
}

/// Insert an entry, evicting any prior entry with the same output filename,
/// then order by timestamp descending. At most one entry per filename is an
/// external contract.
pub fn apply_entry(mut entries: Vec<HistoryEntry>, entry: HistoryEntry) -> Vec<HistoryEntry> {
    entries.retain(|e| e.filename != entry.filename);
    entries.push(entry);
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

fn log_index_state(which: &str, load: &IndexLoad) {
    match load {
        IndexLoad::Loaded(entries) => {
            info!(index = which, entries = entries.len(), "history index loaded")
        }
        IndexLoad::Empty => info!(index = which, "history index absent, starting empty"),
        IndexLoad::Corrupt(why) => {
            warn!(index = which, %why, "history index unreadable, starting empty")
        }
    }
}

/// Read-modify-write the local history index and latest pointer. Runs on
/// every successful build, independent of remote availability.
pub fn update_local_index(index_path: &Path, latest_path: &Path, entry: &HistoryEntry) -> Result<()> {
    let load = match fs::read(index_path) {
        Ok(bytes) => parse_index(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexLoad::Empty,
        Err(e) => IndexLoad::Corrupt(e.to_string()),
    };
    log_index_state("local", &load);
    let merged = apply_entry(load.into_entries(), entry.clone());
    if let Some(parent) = index_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    fs::write(index_path, render_index(merged)?)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", index_path.display())))?;
    fs::write(latest_path, serde_json::to_vec_pretty(&latest_pointer(entry))?)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", latest_path.display())))?;
    Ok(())
}

/// Read-modify-write the remote history index and latest pointer. No
/// optimistic-concurrency token exists here; concurrent runs for the same
/// device are an operational constraint, not a handled case.
pub fn update_remote_index(bucket: &dyn Bucket, entry: &HistoryEntry) -> Result<()> {
    let load = match bucket.download_bytes(HISTORY_INDEX_KEY)? {
        Some(bytes) => parse_index(&bytes),
        None => IndexLoad::Empty,
    };
    log_index_state("remote", &load);
    let merged = apply_entry(load.into_entries(), entry.clone());
    bucket.upload_bytes(&render_index(merged)?, HISTORY_INDEX_KEY)?;
    bucket.upload_bytes(
        &serde_json::to_vec_pretty(&latest_pointer(entry))?,
        LATEST_POINTER_KEY,
    )?;
    Ok(())
}

pub fn latest_pointer(entry: &HistoryEntry) -> LatestPointer {
    LatestPointer {
        schema: INDEX_SCHEMA,
        date: entry.build_date.clone(),
        build_id: entry.android_version.clone(),
        asset_url: entry.url.clone(),
    }
}

pub struct PublishRequest<'a> {
    pub device: &'a str,
    pub artifact: &'a Path,
    pub csig: Option<&'a Path>,
    /// Extra raw/minimal deliverable to publish alongside the update zip.
    pub shape_artifact: Option<&'a Path>,
    pub record_path: &'a Path,
    pub images_dir: Option<&'a Path>,
}

/// Publish a build. Upload order is significant: the primary artifact goes
/// first and a failure there aborts before any index is touched, so an index
/// never points at a missing artifact. Everything after it is best-effort.
pub fn publish(bucket: &dyn Bucket, req: &PublishRequest<'_>) -> Result<HistoryEntry> {
    let filename = req
        .artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::tagged(Reason::Upload, "artifact path has no filename"))?;
    let date_str = Utc::now().format("%Y%m%d").to_string();
    let prefix = format!("builds/{}/{}", req.device, date_str);
    let object = format!("{prefix}/{filename}");

    bucket
        .upload(req.artifact, &object)
        .map_err(|e| e.with_reason(Reason::Upload))?;
    info!(bucket = bucket.name(), %object, "artifact uploaded");

    if let Some(csig) = req.csig {
        if let Err(e) = bucket.upload(csig, &format!("{object}.csig")) {
            warn!(error = %e, "csig upload failed, continuing");
        }
    }
    if let Some(extra) = req.shape_artifact {
        match extra.file_name().map(|n| n.to_string_lossy().to_string()) {
            Some(name) => {
                if let Err(e) = bucket.upload(extra, &format!("{prefix}/{name}")) {
                    warn!(error = %e, "shape deliverable upload failed, continuing");
                }
            }
            None => warn!(path = %extra.display(), "shape deliverable has no filename, skipping"),
        }
    }
    if req.record_path.is_file() {
        if let Err(e) = bucket.upload(req.record_path, &format!("{prefix}/info.json")) {
            warn!(error = %e, "build report upload failed, continuing");
        }
    }
    if let Some(images_dir) = req.images_dir {
        upload_images(bucket, images_dir, &format!("{prefix}/images"));
    }

    let url = format!("https://storage.googleapis.com/{}/{}", bucket.name(), object);
    let entry = entry_for(req.device, &filename, &url, &object);
    update_remote_index(bucket, &entry)?;
    Ok(entry)
}

/// Best-effort bounded-fan-out upload of extracted image files. The objects
/// are write-once and order-independent, so workers need no coordination
/// beyond a shared cursor.
fn upload_images(bucket: &dyn Bucket, dir: &Path, prefix: &str) {
    let files: Vec<_> = walkdir::WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    if files.is_empty() {
        return;
    }

    let workers = MAX_UPLOAD_WORKERS.min(num_cpus::get().max(1)).min(files.len());
    let cursor = AtomicUsize::new(0);
    let failures = Mutex::new(Vec::<String>::new());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let i = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(path) = files.get(i) else { break };
                    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string())
                    else {
                        continue;
                    };
                    if let Err(e) = bucket.upload(path, &format!("{prefix}/{name}")) {
                        failures.lock().expect("poisoned").push(format!("{name}: {e}"));
                    }
                }
            });
        }
    });

    let failures = failures.into_inner().expect("poisoned");
    if failures.is_empty() {
        info!(count = files.len(), "extracted images uploaded");
    } else {
        warn!(failed = failures.len(), detail = %failures.join("; "), "some image uploads failed");
    }
}
