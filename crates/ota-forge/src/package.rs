use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

use crate::cache;
use crate::config::{Config, OutputShape};
use crate::error::{Error, Reason, Result};
use crate::patch::Patcher;
use crate::process::run_checked;

#[derive(Debug)]
pub struct PackagedOutput {
    /// Directory of extracted boot images, when extraction succeeded.
    pub images_dir: Option<PathBuf>,
    /// Extra deliverable for the raw/minimal output shapes.
    pub shape_artifact: Option<PathBuf>,
    pub work_area_hash: Option<String>,
    /// A previous package was reused because the work area fingerprint was
    /// unchanged.
    pub reused_previous: bool,
}

/// Post-patch packaging: image extraction, the structural no-change
/// short-circuit, and the optional raw/minimal deliverables. The signed
/// update zip itself is already final at this point.
pub fn package(
    cfg: &Config,
    patcher: &dyn Patcher,
    artifact: &Path,
    previous_work_area_hash: Option<&str>,
) -> Result<PackagedOutput> {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| Error::tagged(Reason::Package, "artifact path has no stem"))?;
    let images_dir = cfg.output_dir.join(&stem);

    let extracted = match patcher.extract_images(artifact, &images_dir) {
        Ok(()) => true,
        Err(e) => {
            if cfg.shape == OutputShape::Full {
                // Extraction only feeds the manual-flash convenience files
                // here; the update zip is unaffected.
                warn!(error = %e, "boot image extraction failed, continuing");
                false
            } else {
                return Err(e.with_reason(Reason::Package));
            }
        }
    };

    let work_hash = extracted.then(|| cache::work_area_hash(&images_dir));

    let shape_artifact = match cfg.shape {
        OutputShape::Full => None,
        OutputShape::Raw => {
            let raw = images_dir.join("init_boot.img");
            if !raw.is_file() {
                return Err(Error::tagged(
                    Reason::Package,
                    format!("raw output requested but {} is missing", raw.display()),
                ));
            }
            Some(raw)
        }
        OutputShape::Minimal => {
            let dest = cfg.work_dir.join(format!("minimal_{stem}.zip"));
            let unchanged = match (previous_work_area_hash, work_hash.as_deref()) {
                (Some(prev), Some(cur)) => prev == cur,
                _ => false,
            };
            if unchanged && dest.is_file() {
                info!(package = %dest.display(), "work area unchanged, reusing previous package");
                return Ok(PackagedOutput {
                    images_dir: Some(images_dir),
                    shape_artifact: Some(dest),
                    work_area_hash: work_hash,
                    reused_previous: true,
                });
            }
            zip_minimal(cfg, &images_dir, &dest)?;
            Some(dest)
        }
    };

    Ok(PackagedOutput {
        images_dir: extracted.then_some(images_dir),
        shape_artifact,
        work_area_hash: work_hash,
        reused_previous: false,
    })
}

/// Zip only the modified image files. Paths are passed explicitly; nothing
/// here depends on the process working directory.
fn zip_minimal(cfg: &Config, images_dir: &Path, dest: &Path) -> Result<()> {
    let files: Vec<PathBuf> = cache::WORK_AREA_FILES
        .iter()
        .filter(|name| name.ends_with(".img"))
        .map(|name| images_dir.join(name))
        .filter(|p| p.is_file())
        .collect();
    if files.is_empty() {
        return Err(Error::tagged(
            Reason::Package,
            format!("no image files found under {}", images_dir.display()),
        ));
    }

    if dest.is_file() {
        std::fs::remove_file(dest)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dest.display())))?;
    }

    let mut cmd = Command::new("zip");
    cmd.arg("-j")
        .arg(if cfg.fast_compression { "-0" } else { "-9" })
        .arg("-q")
        .arg(dest);
    for file in &files {
        cmd.arg(file);
    }
    info!(package = %dest.display(), files = files.len(), "creating minimal package");
    run_checked(cmd, cfg.tool_timeout).map_err(|e| e.with_reason(Reason::Package))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
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

    /// Extraction writes fixed images, but only when absent, so repeated
    /// calls leave the work-area fingerprint untouched.
    struct StubPatcher;

    impl Patcher for StubPatcher {
        fn patch(&self, _input: &Path, _output: &Path, _key: &Path) -> Result<()> {
            Ok(())
        }

        fn ensure_cert(&self, key: &Path) -> Result<PathBuf> {
            Ok(key.with_extension("crt"))
        }

        fn extract_images(&self, _artifact: &Path, dest: &Path) -> Result<()> {
            fs::create_dir_all(dest)?;
            for name in ["boot.img", "init_boot.img"] {
                let path = dest.join(name);
                if !path.exists() {
                    fs::write(path, name)?;
                }
            }
            Ok(())
        }

        fn generate_csig(&self, artifact: &Path, _key: &Path, _cert: &Path) -> Result<PathBuf> {
            Ok(PathBuf::from(format!("{}.csig", artifact.display())))
        }

        fn write_update_descriptor(&self, _location_url: &str, dest: &Path) -> Result<()> {
            fs::write(dest, "{}")?;
            Ok(())
        }
    }

    #[test]
    fn raw_shape_yields_the_patched_init_boot_image() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = test_config(tmp.path());
        cfg.shape = OutputShape::Raw;
        fs::create_dir_all(&cfg.output_dir).expect("mkdir");
        let artifact = cfg.output_dir.join("ksu_patched_build-123.zip");
        fs::write(&artifact, b"zip").expect("write");

        let out = package(&cfg, &StubPatcher, &artifact, None).expect("package");
        assert!(!out.reused_previous);
        let expected = cfg
            .output_dir
            .join("ksu_patched_build-123")
            .join("init_boot.img");
        assert_eq!(out.shape_artifact.as_deref(), Some(expected.as_path()));
        assert!(expected.is_file());
    }

    #[test]
    fn minimal_shape_reuses_previous_package_when_work_area_is_unchanged() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = test_config(tmp.path());
        cfg.shape = OutputShape::Minimal;
        fs::create_dir_all(&cfg.output_dir).expect("mkdir");
        fs::create_dir_all(&cfg.work_dir).expect("mkdir");
        let artifact = cfg.output_dir.join("ksu_patched_build-123.zip");
        fs::write(&artifact, b"zip").expect("write");

        // Seed the work area and record its fingerprint as the prior run's.
        let images_dir = cfg.output_dir.join("ksu_patched_build-123");
        StubPatcher.extract_images(&artifact, &images_dir).expect("extract");
        let prev = cache::work_area_hash(&images_dir);

        let dest = cfg.work_dir.join("minimal_ksu_patched_build-123.zip");
        fs::write(&dest, b"previous package").expect("write");

        let out = package(&cfg, &StubPatcher, &artifact, Some(&prev)).expect("package");
        assert!(out.reused_previous);
        assert_eq!(out.shape_artifact.as_deref(), Some(dest.as_path()));
        assert_eq!(out.work_area_hash.as_deref(), Some(prev.as_str()));
        // The reuse path must not rewrite the package.
        assert_eq!(fs::read(&dest).expect("read"), b"previous package");
    }
}
