use std::path::Path;

use crate::error::{Reason, Result};

pub mod dir;
pub mod gcs;

pub use dir::DirBucket;
pub use gcs::GcsBucket;

/// Remote object store seam. "Not found" is a distinguishable non-error so
/// cache misses never collapse into transport failures.
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Returns `false` when the object does not exist.
    fn download(&self, key: &str, dest: &Path) -> Result<bool>;

    fn download_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn upload(&self, src: &Path, key: &str) -> Result<()>;

    fn upload_bytes(&self, data: &[u8], key: &str) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// Fail-fast access check: a real write-then-delete round trip. A list-only
/// permission can exist without write permission, so a metadata probe is not
/// enough to promise the final upload will succeed.
pub fn preflight_probe(bucket: &dyn Bucket) -> Result<()> {
    let key = format!(
        ".otaforge_probe_{}",
        chrono::Utc::now().timestamp_millis()
    );
    bucket.upload_bytes(b"probe", &key).map_err(|e| {
        e.with_reason(Reason::Preflight)
    })?;
    bucket.delete(&key).map_err(|e| e.with_reason(Reason::Preflight))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_probe_round_trips_and_cleans_up() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bucket = DirBucket::new("probe-test", tmp.path());
        preflight_probe(&bucket).expect("probe");
        // Nothing left behind.
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .expect("read_dir")
            .collect();
        assert!(leftovers.is_empty());
    }
}
