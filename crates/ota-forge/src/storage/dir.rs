use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage::Bucket;

/// Directory-backed bucket used for offline runs and tests. Keys map to
/// relative paths under the root; `..` segments are rejected.
pub struct DirBucket {
    name: String,
    root: PathBuf,
}

impl DirBucket {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::msg("empty object key"));
        }
        let rel = Path::new(key);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::msg(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(rel))
    }
}

impl Bucket for DirBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key)?.is_file())
    }

    fn download(&self, key: &str, dest: &Path) -> Result<bool> {
        let src = self.object_path(key)?;
        if !src.is_file() {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        fs::copy(&src, dest).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} -> {}: {e}",
                src.display(),
                dest.display()
            ))
        })?;
        Ok(true)
    }

    fn download_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let src = self.object_path(key)?;
        if !src.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&src)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", src.display())))?;
        Ok(Some(bytes))
    }

    fn upload(&self, src: &Path, key: &str) -> Result<()> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        fs::copy(src, &dest).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} -> {}: {e}",
                src.display(),
                dest.display()
            ))
        })?;
        Ok(())
    }

    fn upload_bytes(&self, data: &[u8], key: &str) -> Result<()> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        fs::write(&dest, data)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", dest.display())))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if path.is_file() {
            fs::remove_file(&path)
                .map_err(|e| Error::msg(format!("failed to remove {}: {e}", path.display())))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_missing_object() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bucket = DirBucket::new("t", tmp.path());

        assert!(!bucket.exists("builds/a.zip").expect("exists"));
        assert!(bucket.download_bytes("builds/a.zip").expect("dl").is_none());

        bucket.upload_bytes(b"payload", "builds/a.zip").expect("up");
        assert!(bucket.exists("builds/a.zip").expect("exists"));
        assert_eq!(
            bucket.download_bytes("builds/a.zip").expect("dl").as_deref(),
            Some(&b"payload"[..])
        );

        let dest = tmp.path().join("fetched.zip");
        assert!(bucket.download("builds/a.zip", &dest).expect("dl"));
        assert_eq!(fs::read(&dest).expect("read"), b"payload");

        bucket.delete("builds/a.zip").expect("rm");
        assert!(!bucket.exists("builds/a.zip").expect("exists"));
    }

    #[test]
    fn rejects_traversal_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bucket = DirBucket::new("t", tmp.path());
        assert!(bucket.exists("../escape").is_err());
        assert!(bucket.exists("/abs").is_err());
    }
}
