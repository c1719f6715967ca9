use std::fs;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};

use crate::cache;
use crate::config::Config;
use crate::error::Result;
use crate::fetch::{self, FetchOutcome, SourceTier};
use crate::hashing;
use crate::keys;
use crate::locator::ReleaseLocator;
use crate::metrics::MetricSink;
use crate::patch::Patcher;
use crate::publish::{self, PublishRequest};
use crate::record::{
    BuildMeta, BuildRecord, BuildStatus, InputInfo, OutputInfo, RECORD_SCHEMA, RecordLoad,
    SourceMode,
};
use crate::storage::{Bucket, preflight_probe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    ResolveKey,
    ResolveInput,
    CacheCheck,
    Patch,
    Package,
    Publish,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::ResolveKey => "resolve-key",
            Stage::ResolveInput => "resolve-input",
            Stage::CacheCheck => "cache-check",
            Stage::Patch => "patch",
            Stage::Package => "package",
            Stage::Publish => "publish",
            Stage::Done => "done",
        }
    }
}

fn enter(stage: Stage) {
    info!(stage = stage.as_str(), "pipeline stage");
}

/// Terminal pipeline result. Skips are success-like but distinct from
/// `Built`: callers relying on exit status still see 0, but logs and metrics
/// never claim work happened when it did not.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Built { output: String },
    SkippedCacheHit { output: String },
    SkippedHistoryHit { output: String },
}

pub struct Deps {
    pub locator: Box<dyn ReleaseLocator>,
    pub patcher: Box<dyn Patcher>,
    pub output_bucket: Option<Box<dyn Bucket>>,
    pub cache_bucket: Option<Box<dyn Bucket>>,
    pub metrics: Box<dyn MetricSink>,
}

/// Run the build pipeline once. Every fatal exit is tagged with a fixed
/// reason and reported to the metric sink before returning.
pub fn run(cfg: &Config, deps: &Deps) -> Result<Outcome> {
    let started = Instant::now();
    match run_stages(cfg, deps) {
        Ok(outcome) => {
            if matches!(outcome, Outcome::Built { .. }) {
                deps.metrics.success(&cfg.device, started.elapsed());
            }
            Ok(outcome)
        }
        Err(e) => {
            deps.metrics.failure(&cfg.device, e.reason().as_str());
            Err(e)
        }
    }
}

fn run_stages(cfg: &Config, deps: &Deps) -> Result<Outcome> {
    let output_bucket = deps.output_bucket.as_deref();
    let cache_bucket = deps.cache_bucket.as_deref();

    // Verify real write access to every configured bucket before anything
    // expensive runs; discovering a write failure after a long patch is the
    // exact scenario preflight exists to prevent.
    enter(Stage::Preflight);
    for bucket in [output_bucket, cache_bucket].into_iter().flatten() {
        preflight_probe(bucket)?;
        info!(bucket = bucket.name(), "bucket access verified");
    }

    enter(Stage::ResolveKey);
    let key = keys::resolve_signing_key(cfg, output_bucket)?;

    enter(Stage::ResolveInput);
    let input = match fetch::resolve(cfg, deps.locator.as_ref(), output_bucket, cache_bucket)? {
        FetchOutcome::Resolved(input) => input,
        FetchOutcome::AlreadyPublished { filename } => {
            return Ok(Outcome::SkippedHistoryHit { output: filename });
        }
    };

    enter(Stage::CacheCheck);
    // The composite key always gets a real content digest. A trusted
    // input skips checksum *verification*, not hashing: two different
    // trusted files must never share a cache key.
    let input_hash = match &input.sha256 {
        Some(hash) => hash.clone(),
        None => hashing::digest_file(&input.path)?,
    };
    let record_path = cfg.record_path();
    if let Some(output) = cache::lookup(&record_path, &input_hash, &key.hash, &cfg.output_dir) {
        info!(%output, "smart skip: output already built for this input and key");
        return Ok(Outcome::SkippedCacheHit { output });
    }
    let previous_work_area_hash = match crate::record::load(&record_path) {
        RecordLoad::Loaded(rec) => rec.build_meta.work_area_hash,
        _ => None,
    };

    enter(Stage::Patch);
    fs::create_dir_all(&cfg.output_dir).map_err(|e| {
        crate::error::Error::msg(format!("failed to create {}: {e}", cfg.output_dir.display()))
    })?;
    let output_filename = publish::output_filename_for(&input.filename);
    let output_path = cfg.output_dir.join(&output_filename);
    deps.patcher.patch(&input.path, &output_path, &key.path)?;

    enter(Stage::Package);
    let packaged = crate::package::package(
        cfg,
        deps.patcher.as_ref(),
        &output_path,
        previous_work_area_hash.as_deref(),
    )?;
    if let Some(extra) = packaged.shape_artifact.as_deref() {
        info!(
            artifact = %extra.display(),
            reused = packaged.reused_previous,
            "shape deliverable ready"
        );
    }
    let csig = match deps.patcher.ensure_cert(&key.path).and_then(|cert| {
        deps.patcher.generate_csig(&output_path, &key.path, &cert)
    }) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(error = %e, "update-metadata signature generation failed, continuing");
            None
        }
    };
    let output_hash = hashing::digest_file(&output_path)?;

    let record = BuildRecord {
        schema: RECORD_SCHEMA,
        build_meta: BuildMeta {
            device: cfg.device.clone(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            status: BuildStatus::Success,
            last_successful_build: Some(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()),
            mode: match input.tier {
                SourceTier::LocalFile => SourceMode::LocalFile,
                _ => SourceMode::AutoDownload,
            },
            from_cache: matches!(
                input.tier,
                SourceTier::DownloadCache | SourceTier::RemoteCache
            ),
            key_hash: key.hash.clone(),
            work_area_hash: packaged.work_area_hash.clone(),
        },
        input: InputInfo {
            filename: input.filename.clone(),
            sha256: input_hash,
            trust: input.trust,
            // avbroot validates the vendor signature of the input zip
            // internally and refuses to patch an unsigned artifact.
            upstream_signature_verified: true,
        },
        output: OutputInfo {
            filename: output_filename.clone(),
            sha256: output_hash,
            csig: csig
                .as_deref()
                .map(|p| p.to_string_lossy().to_string()),
            shape_artifact: packaged
                .shape_artifact
                .as_deref()
                .map(|p| p.to_string_lossy().to_string()),
            flash_command: format!("fastboot update {output_filename}"),
            signed_by: key
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        },
    };
    crate::record::store(&record_path, &record)?;
    info!(record = %record_path.display(), "build record written");

    enter(Stage::Publish);
    let entry = match output_bucket {
        Some(bucket) => {
            let entry = publish::publish(
                bucket,
                &PublishRequest {
                    device: &cfg.device,
                    artifact: &output_path,
                    csig: csig.as_deref(),
                    shape_artifact: packaged.shape_artifact.as_deref(),
                    record_path: &record_path,
                    images_dir: packaged.images_dir.as_deref(),
                },
            )?;
            // Update-descriptor for the OTA client; regenerated, never
            // hand-edited. Best-effort on both generation and upload.
            let descriptor_path = cfg.output_dir.join(format!("{}.json", cfg.device));
            match deps
                .patcher
                .write_update_descriptor(&entry.url, &descriptor_path)
            {
                Ok(()) => {
                    if let Err(e) =
                        bucket.upload(&descriptor_path, &format!("{}.json", cfg.device))
                    {
                        warn!(error = %e, "update descriptor upload failed, continuing");
                    }
                }
                Err(e) => warn!(error = %e, "update descriptor generation failed, continuing"),
            }
            entry
        }
        // Offline run: a relative URL keeps the local discovery index
        // usable by the local web client.
        None => publish::entry_for(&cfg.device, &output_filename, &output_filename, ""),
    };
    // The local index is maintained unconditionally so offline runs still
    // produce a consistent discovery index.
    publish::update_local_index(&cfg.local_index_path(), &cfg.local_latest_path(), &entry)?;

    enter(Stage::Done);
    Ok(Outcome::Built {
        output: output_filename,
    })
}
