use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::warn;

use crate::hashing;
use crate::record::{self, BuildStatus, RecordLoad};

/// Image files that participate in the work-area fingerprint. Size and mtime
/// only, never full content, so the check stays cheap for multi-GB trees.
pub const WORK_AREA_FILES: &[&str] = &[
    "boot.img",
    "init_boot.img",
    "vendor_boot.img",
    "vbmeta.img",
    "payload.bin",
    "payload_properties.txt",
];

/// Composite cache key identifying a unique build output.
pub fn composite_key(input_hash: &str, key_hash: &str) -> String {
    format!("{input_hash}_{key_hash}")
}

/// Smart-skip lookup against the persisted Build Record. A hit requires the
/// last run to have succeeded with the same composite key and the recorded
/// output file to still exist; everything else is a clean miss. Existence is
/// re-checked every time, never cached as a boolean.
pub fn lookup(
    record_path: &Path,
    input_hash: &str,
    key_hash: &str,
    out_dir: &Path,
) -> Option<String> {
    let rec = match record::load(record_path) {
        RecordLoad::Loaded(rec) => rec,
        RecordLoad::Absent => return None,
        RecordLoad::Corrupt(why) => {
            warn!(record = %record_path.display(), %why, "build record unreadable, treating as miss");
            return None;
        }
    };

    if rec.build_meta.status != BuildStatus::Success {
        return None;
    }
    if rec.input.sha256 != input_hash || rec.build_meta.key_hash != key_hash {
        return None;
    }
    let filename = rec.output.filename;
    if filename.is_empty() {
        return None;
    }
    if !out_dir.join(&filename).is_file() {
        return None;
    }
    Some(filename)
}

/// Structural fingerprint of the work area: name, size, and mtime seconds of
/// the well-known output files. Detects "nothing observable changed" without
/// re-hashing large artifacts.
pub fn work_area_hash(dir: &Path) -> String {
    let mut lines = Vec::new();
    for name in WORK_AREA_FILES {
        let Ok(md) = std::fs::metadata(dir.join(name)) else {
            continue;
        };
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        lines.push(format!("{name}:{}:{mtime}", md.len()));
    }
    hashing::digest_string(&lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BuildMeta, BuildRecord, InputInfo, OutputInfo, RECORD_SCHEMA};
    use std::fs;

    fn success_record(input_hash: &str, key_hash: &str, output: &str) -> BuildRecord {
        BuildRecord {
            schema: RECORD_SCHEMA,
            build_meta: BuildMeta {
                device: "frankel".into(),
                status: BuildStatus::Success,
                key_hash: key_hash.into(),
                ..Default::default()
            },
            input: InputInfo {
                filename: "build-123.zip".into(),
                sha256: input_hash.into(),
                ..Default::default()
            },
            output: OutputInfo {
                filename: output.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn hit_requires_success_matching_key_and_existing_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let record_path = tmp.path().join("build_status.json");
        let out_dir = tmp.path();
        let input = "a".repeat(64);
        let key = "b".repeat(64);

        // No record at all: miss.
        assert!(lookup(&record_path, &input, &key, out_dir).is_none());

        let rec = success_record(&input, &key, "ksu_patched_build-123.zip");
        record::store(&record_path, &rec).expect("store");

        // Output missing on disk: miss.
        assert!(lookup(&record_path, &input, &key, out_dir).is_none());

        fs::write(out_dir.join("ksu_patched_build-123.zip"), b"zip").expect("write");
        assert_eq!(
            lookup(&record_path, &input, &key, out_dir).as_deref(),
            Some("ksu_patched_build-123.zip")
        );

        // Different input hash: miss.
        assert!(lookup(&record_path, &"c".repeat(64), &key, out_dir).is_none());
        // Different key hash: miss.
        assert!(lookup(&record_path, &input, &"d".repeat(64), out_dir).is_none());

        // Failed record: miss.
        let mut failed = success_record(&input, &key, "ksu_patched_build-123.zip");
        failed.build_meta.status = BuildStatus::Failed;
        record::store(&record_path, &failed).expect("store");
        assert!(lookup(&record_path, &input, &key, out_dir).is_none());
    }

    #[test]
    fn corrupt_record_is_a_clean_miss() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let record_path = tmp.path().join("build_status.json");
        fs::write(&record_path, "][").expect("write");
        assert!(lookup(&record_path, "x", "y", tmp.path()).is_none());
    }

    #[test]
    fn work_area_hash_tracks_size_and_mtime() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("boot.img"), b"boot").expect("write");
        fs::write(tmp.path().join("init_boot.img"), b"init").expect("write");
        fs::write(tmp.path().join("unrelated.txt"), b"x").expect("write");

        let first = work_area_hash(tmp.path());
        assert_eq!(first, work_area_hash(tmp.path()));

        // Unrelated files do not participate.
        fs::write(tmp.path().join("unrelated.txt"), b"changed").expect("write");
        assert_eq!(first, work_area_hash(tmp.path()));

        // An mtime bump on a tracked file changes the fingerprint.
        let target = tmp.path().join("boot.img");
        let bumped = filetime::FileTime::from_unix_time(2_000_000_000, 0);
        filetime::set_file_mtime(&target, bumped).expect("mtime");
        assert_ne!(first, work_area_hash(tmp.path()));
    }
}
