use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::process::{command_summary, is_not_found_text, run_checked, run_with_deadline};
use crate::storage::Bucket;

/// GCS bucket driven through the `gcloud storage` CLI. Credentials and
/// project selection are whatever the ambient gcloud configuration provides.
pub struct GcsBucket {
    bucket: String,
    timeout: Duration,
}

impl GcsBucket {
    pub fn new(bucket: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bucket: bucket.into(),
            timeout,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket, key.trim_start_matches('/'))
    }

    fn gcloud(&self) -> Command {
        let mut cmd = Command::new("gcloud");
        cmd.arg("storage");
        cmd
    }
}

impl Bucket for GcsBucket {
    fn name(&self) -> &str {
        &self.bucket
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let mut cmd = self.gcloud();
        cmd.arg("objects").arg("describe").arg(self.object_url(key));
        let out = run_with_deadline(cmd, self.timeout)?;
        if out.success {
            return Ok(true);
        }
        let msg = command_summary(&out);
        if is_not_found_text(&msg) {
            return Ok(false);
        }
        Err(Error::msg(format!("GCS probe failed: {msg}")))
    }

    fn download(&self, key: &str, dest: &Path) -> Result<bool> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let mut cmd = self.gcloud();
        cmd.arg("cp").arg(self.object_url(key)).arg(dest);
        let out = run_with_deadline(cmd, self.timeout)?;
        if out.success {
            return Ok(true);
        }
        let msg = command_summary(&out);
        if is_not_found_text(&msg) {
            return Ok(false);
        }
        Err(Error::msg(format!("GCS download failed: {msg}")))
    }

    fn download_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let staging = tempfile::NamedTempFile::new()
            .map_err(|e| Error::msg(format!("failed to create staging file: {e}")))?;
        if !self.download(key, staging.path())? {
            return Ok(None);
        }
        let bytes = fs::read(staging.path())
            .map_err(|e| Error::msg(format!("failed to read staging file: {e}")))?;
        Ok(Some(bytes))
    }

    fn upload(&self, src: &Path, key: &str) -> Result<()> {
        let mut cmd = self.gcloud();
        cmd.arg("cp").arg(src).arg(self.object_url(key));
        run_checked(cmd, self.timeout)?;
        Ok(())
    }

    fn upload_bytes(&self, data: &[u8], key: &str) -> Result<()> {
        let staging = tempfile::NamedTempFile::new()
            .map_err(|e| Error::msg(format!("failed to create staging file: {e}")))?;
        fs::write(staging.path(), data)
            .map_err(|e| Error::msg(format!("failed to write staging file: {e}")))?;
        self.upload(staging.path(), key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut cmd = self.gcloud();
        cmd.arg("rm").arg(self.object_url(key));
        run_checked(cmd, self.timeout)?;
        Ok(())
    }
}
