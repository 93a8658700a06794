//! Package-manager port bootstrap
//!
//! Before the worker pool starts, the designated `ports-mgmt/pkg` node (if
//! present in the resolved graph) is built or recovered from cache so every
//! other worker can rely on a working `pkg` binary in its `Template` tree
//! (§4.7). Failure here aborts the run before any regular worker starts.

use crate::errors::{BuildError, Result};
use crate::phase::{run_phases, PhaseOptions};
use crate::store::Store;
use crate::worker_env::{WorkerBackend, WorkerSetupConfig};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Sentinel worker id reserved for the bootstrap's single-worker build.
pub const BOOTSTRAP_WORKER_ID: u32 = 99;

pub const PKG_MANAGER_PORTDIR: &str = "ports-mgmt/pkg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// No `ports-mgmt/pkg` node in the resolved graph; nothing to do.
    NotNeeded,
    /// A working `pkg` was already present in the Template tree.
    AlreadyInstalled,
    /// The cached package matched the stored CRC and was unpacked.
    UnpackedFromCache,
    /// A fresh single-worker build succeeded and was unpacked.
    Built,
}

/// Runs the bootstrap sequence (§4.7). `crc` is the freshly computed CRC of
/// `ports-mgmt/pkg`'s port directory, used to decide whether the cached
/// package is still current.
#[instrument(skip(store, backend, cancel))]
pub async fn bootstrap_pkg_manager(
    template_dir: &Path,
    packages_dir: &Path,
    store: &Store,
    crc: u32,
    setup_cfg: &WorkerSetupConfig,
    backend: &mut dyn WorkerBackend,
    cancel: &CancellationToken,
) -> Result<BootstrapOutcome> {
    let pkg_binary = template_dir.join("usr/local/sbin/pkg");
    let pkgfile = packages_dir.join("All").join(pkgfile_name());

    if pkg_binary.is_file() && pkgfile.is_file() {
        info!("pkg manager already installed in Template, bootstrap skipped");
        return Ok(BootstrapOutcome::AlreadyInstalled);
    }

    if let Some(stored_crc) = store.get_crc(PKG_MANAGER_PORTDIR)? {
        if stored_crc == crc && pkgfile.is_file() {
            unpack_into_template(&pkgfile, template_dir)?;
            info!("pkg manager unpacked from cached package");
            return Ok(BootstrapOutcome::UnpackedFromCache);
        }
    }

    backend.setup(BOOTSTRAP_WORKER_ID, setup_cfg).await.map_err(|e| {
        warn!(error = %e, "bootstrap worker setup failed");
        e
    })?;

    // No prior port has built this run yet, so there are no dependency
    // packages to pre-install here.
    let outcome = run_phases(backend, PKG_MANAGER_PORTDIR, None, &[], PhaseOptions::default(), cancel).await;
    backend.cleanup().await.ok();

    match outcome? {
        crate::phase::PhaseRunOutcome::Success => {
            if pkgfile.is_file() {
                unpack_into_template(&pkgfile, template_dir)?;
            }
            store.set_crc(PKG_MANAGER_PORTDIR, crc)?;
            info!("pkg manager bootstrap build succeeded");
            Ok(BootstrapOutcome::Built)
        }
        crate::phase::PhaseRunOutcome::Failed { phase, exit_code } => {
            Err(BuildError::BootstrapFailed {
                reason: format!("bootstrap build failed at phase {phase} (exit {exit_code})"),
            })
        }
    }
}

fn pkgfile_name() -> String {
    "pkg.txz".to_string()
}

/// Unpacks `pkgfile` into `template_dir`, skipping manifest (`+`-prefixed)
/// and man-page entries (§4.7).
fn unpack_into_template(pkgfile: &Path, template_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(pkgfile).map_err(|e| BuildError::BootstrapFailed {
        reason: format!("opening cached package {}: {e}", pkgfile.display()),
    })?;
    let mut archive = tar::Archive::new(file);
    let entries = archive.entries().map_err(|e| BuildError::BootstrapFailed {
        reason: format!("reading package archive: {e}"),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| BuildError::BootstrapFailed {
            reason: format!("reading archive entry: {e}"),
        })?;
        let path: PathBuf = entry.path().map_err(|e| BuildError::BootstrapFailed {
            reason: e.to_string(),
        })?.into_owned();

        let skip = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('+'))
            .unwrap_or(false)
            || path.to_string_lossy().contains("man/");
        if skip {
            continue;
        }

        entry.unpack_in(template_dir).map_err(|e| BuildError::BootstrapFailed {
            reason: format!("unpacking {}: {e}", path.display()),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::worker_env::FakeWorkerEnv;

    fn setup_cfg(build_base: &Path) -> WorkerSetupConfig {
        WorkerSetupConfig {
            build_base: build_base.to_path_buf(),
            ports_dir: PathBuf::from("/xports"),
            options_dir: PathBuf::from("/options"),
            packages_dir: PathBuf::from("/packages"),
            distfiles_dir: PathBuf::from("/distfiles"),
            ccache_dir: None,
            system_path: "/".to_string(),
            system_mounts: vec![],
            use_usr_src: false,
            construction_size_hint: None,
            localbase_size_hint: None,
        }
    }

    #[tokio::test]
    async fn already_installed_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("Template");
        std::fs::create_dir_all(template.join("usr/local/sbin")).unwrap();
        std::fs::write(template.join("usr/local/sbin/pkg"), b"binary").unwrap();
        let packages = dir.path().join("packages");
        std::fs::create_dir_all(packages.join("All")).unwrap();
        std::fs::write(packages.join("All").join("pkg.txz"), b"pkg").unwrap();

        let store = Store::open(dir.path().join("db")).unwrap();
        let mut backend = FakeWorkerEnv::new();

        let outcome = bootstrap_pkg_manager(
            &template,
            &packages,
            &store,
            123,
            &setup_cfg(dir.path()),
            &mut backend,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, BootstrapOutcome::AlreadyInstalled);
        assert_eq!(backend.setup_calls, 0);
    }

    #[tokio::test]
    async fn builds_when_nothing_cached() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("Template");
        let packages = dir.path().join("packages");
        let store = Store::open(dir.path().join("db")).unwrap();
        let mut backend = FakeWorkerEnv::new();

        let outcome = bootstrap_pkg_manager(
            &template,
            &packages,
            &store,
            123,
            &setup_cfg(dir.path()),
            &mut backend,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, BootstrapOutcome::Built);
        assert_eq!(backend.setup_calls, 1);
        assert_eq!(backend.cleanup_calls, 1);
        assert_eq!(store.get_crc(PKG_MANAGER_PORTDIR).unwrap(), Some(123));
    }

    #[tokio::test]
    async fn failed_build_reports_bootstrap_failed() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("Template");
        let packages = dir.path().join("packages");
        let store = Store::open(dir.path().join("db")).unwrap();
        let mut backend = FakeWorkerEnv::new();
        backend.fail_command = Some("make".to_string());

        let err = bootstrap_pkg_manager(
            &template,
            &packages,
            &store,
            123,
            &setup_cfg(dir.path()),
            &mut backend,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BuildError::BootstrapFailed { .. }));
    }
}
