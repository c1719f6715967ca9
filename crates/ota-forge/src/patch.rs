use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Reason, Result};
use crate::keys;
use crate::process::run_checked;

/// Patch & Sign seam. The cryptographic work happens in external tools; the
/// pipeline only depends on this contract.
pub trait Patcher: Send + Sync {
    /// Patch and re-sign the input artifact. Failure is fatal and never
    /// retried: the tool is deterministic, a second attempt with the same
    /// inputs fails identically.
    fn patch(&self, input: &Path, output: &Path, key: &Path) -> Result<()>;

    /// Derive the OTA certificate from the signing key. Cached by path;
    /// regenerated only when absent.
    fn ensure_cert(&self, key: &Path) -> Result<PathBuf>;

    /// Extract boot images from the signed artifact (best-effort side op).
    fn extract_images(&self, artifact: &Path, dest: &Path) -> Result<()>;

    /// Generate the update-metadata signature side-file (best-effort).
    fn generate_csig(&self, artifact: &Path, key: &Path, cert: &Path) -> Result<PathBuf>;

    /// Regenerate the update-descriptor document pointing at `location_url`.
    fn write_update_descriptor(&self, location_url: &str, dest: &Path) -> Result<()>;
}

/// Production implementation shelling out to `avbroot`, `openssl`, and
/// `custota-tool`.
pub struct AvbRootPatcher {
    /// Pre-bundled root-module zip baked into the runtime image.
    pub magisk_zip: PathBuf,
    pub preinit_device: String,
    /// Where derived certificates live; the key directory itself may be a
    /// read-only secret mount.
    pub cert_dir: PathBuf,
    pub avb_passphrase: Option<String>,
    pub timeout: Duration,
}

impl AvbRootPatcher {
    pub fn new(cert_dir: PathBuf, avb_passphrase: Option<String>, timeout: Duration) -> Self {
        Self {
            magisk_zip: PathBuf::from("/usr/local/share/magisk.zip"),
            preinit_device: "metadata".to_string(),
            cert_dir,
            avb_passphrase,
            timeout,
        }
    }
}

impl Patcher for AvbRootPatcher {
    fn patch(&self, input: &Path, output: &Path, key: &Path) -> Result<()> {
        if !self.magisk_zip.is_file() {
            return Err(Error::tagged(
                Reason::Patch,
                format!("bundled root module missing: {}", self.magisk_zip.display()),
            ));
        }
        let cert = self.ensure_cert(key)?;

        let mut cmd = Command::new("avbroot");
        cmd.arg("ota")
            .arg("patch")
            .arg("--input")
            .arg(input)
            .arg("--output")
            .arg(output)
            .arg("--key-avb")
            .arg(key)
            .arg("--key-ota")
            .arg(key)
            .arg("--cert-ota")
            .arg(&cert)
            .arg("--magisk")
            .arg(&self.magisk_zip)
            .arg("--magisk-preinit-device")
            .arg(&self.preinit_device);
        if let Some(pass) = self.avb_passphrase.as_deref() {
            cmd.env("AVBROOT_PASSPHRASE", pass);
        }
        info!(input = %input.display(), output = %output.display(), "running avbroot patch");
        run_checked(cmd, self.timeout).map_err(|e| e.with_reason(Reason::Patch))?;
        Ok(())
    }

    fn ensure_cert(&self, key: &Path) -> Result<PathBuf> {
        let cert = self.cert_dir.join(keys::cert_name_for(key));
        if cert.is_file() {
            return Ok(cert);
        }
        fs::create_dir_all(&self.cert_dir).map_err(|e| {
            Error::tagged(
                Reason::Patch,
                format!("failed to create {}: {e}", self.cert_dir.display()),
            )
        })?;
        info!(cert = %cert.display(), "generating OTA certificate from key");
        let mut cmd = Command::new("openssl");
        cmd.arg("req")
            .arg("-new")
            .arg("-x509")
            .arg("-key")
            .arg(key)
            .arg("-out")
            .arg(&cert)
            .arg("-days")
            .arg("10000")
            .arg("-subj")
            .arg("/CN=OtaForge");
        run_checked(cmd, self.timeout).map_err(|e| e.with_reason(Reason::Patch))?;
        Ok(cert)
    }

    fn extract_images(&self, artifact: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        let mut cmd = Command::new("avbroot");
        cmd.arg("ota")
            .arg("extract")
            .arg("--input")
            .arg(artifact)
            .arg("--directory")
            .arg(dest);
        run_checked(cmd, self.timeout)?;
        Ok(())
    }

    fn generate_csig(&self, artifact: &Path, key: &Path, cert: &Path) -> Result<PathBuf> {
        let csig = PathBuf::from(format!("{}.csig", artifact.display()));
        let mut cmd = Command::new("custota-tool");
        cmd.arg("gen-csig")
            .arg("--input")
            .arg(artifact)
            .arg("--key")
            .arg(key)
            .arg("--cert")
            .arg(cert)
            .arg("--output")
            .arg(&csig);
        run_checked(cmd, self.timeout)?;
        Ok(csig)
    }

    fn write_update_descriptor(&self, location_url: &str, dest: &Path) -> Result<()> {
        let mut cmd = Command::new("custota-tool");
        cmd.arg("gen-update-info")
            .arg("--location")
            .arg(location_url)
            .arg("--file")
            .arg(dest);
        run_checked(cmd, self.timeout)?;
        Ok(())
    }
}
