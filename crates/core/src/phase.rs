//! Fixed build phase sequence
//!
//! Runs the ordered phase list for one port on one worker (§4.6). Most
//! phases are a `make <phase>` call inside the chroot with a fixed
//! overrides set; `install-pkgs` instead installs each already-built
//! dependency's package file, and the `*-depends` phases are no-ops (the
//! main phase implies them).

use crate::errors::{BuildError, Result};
use crate::worker_env::{ExecConfig, WorkerBackend};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// The fixed, ordered phase sequence (§4.6).
pub const PHASES: &[&str] = &[
    "install-pkgs",
    "check-sanity",
    "fetch-depends",
    "fetch",
    "checksum",
    "extract-depends",
    "extract",
    "patch-depends",
    "patch",
    "build-depends",
    "lib-depends",
    "configure",
    "build",
    "run-depends",
    "stage",
    "check-plist",
    "package",
];

fn is_depends_noop(phase: &str) -> bool {
    phase.ends_with("-depends") && phase != "install-pkgs"
}

/// Fixed make overrides applied to every `make <phase>` invocation (§4.6).
pub fn make_overrides(flavor: Option<&str>) -> Vec<(String, String)> {
    let mut overrides = vec![
        ("PORTSDIR".to_string(), "/xports".to_string()),
        ("WRKDIRPREFIX".to_string(), "/construction".to_string()),
        ("DISTDIR".to_string(), "/distfiles".to_string()),
        ("PACKAGES".to_string(), "/packages".to_string()),
        ("PKG_DBDIR".to_string(), "/var/db/pkg".to_string()),
        ("BATCH".to_string(), "yes".to_string()),
    ];
    if let Some(flavor) = flavor {
        overrides.push(("FLAVOR".to_string(), flavor.to_string()));
    }
    overrides
}

/// Options controlling which phases actually run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseOptions {
    pub check_plist_enabled: bool,
}

/// Outcome of running the full phase sequence for one port.
#[derive(Debug, Clone)]
pub enum PhaseRunOutcome {
    Success,
    Failed { phase: String, exit_code: i32 },
}

/// Runs every phase in `PHASES` for `port_dir` against `backend`, in order,
/// stopping at the first non-zero exit. `installed_pkgfiles` is the list of
/// already-built dependency package filenames to install during
/// `install-pkgs` (§4.6).
#[instrument(skip(backend, installed_pkgfiles, cancel), fields(port_dir))]
pub async fn run_phases(
    backend: &mut dyn WorkerBackend,
    port_dir: &str,
    flavor: Option<&str>,
    installed_pkgfiles: &[String],
    options: PhaseOptions,
    cancel: &CancellationToken,
) -> Result<PhaseRunOutcome> {
    let overrides = make_overrides(flavor);

    for &phase in PHASES {
        if phase == "check-plist" && !options.check_plist_enabled {
            continue;
        }
        if is_depends_noop(phase) {
            continue;
        }

        if phase == "install-pkgs" {
            for pkgfile in installed_pkgfiles {
                let result = backend
                    .execute(
                        ExecConfig {
                            command: "pkg".to_string(),
                            args: vec!["add".to_string(), format!("/packages/All/{pkgfile}")],
                            env: vec![],
                            work_dir: None,
                            timeout: None,
                        },
                        cancel,
                    )
                    .await?;
                if result.exit_code != 0 {
                    warn!(pkgfile, exit_code = result.exit_code, "install-pkgs failed for dependency package");
                    return Ok(PhaseRunOutcome::Failed {
                        phase: "install-pkgs".to_string(),
                        exit_code: result.exit_code,
                    });
                }
            }
            continue;
        }

        let result = backend
            .execute(
                ExecConfig {
                    command: "make".to_string(),
                    args: vec![phase.to_string()],
                    env: overrides.clone(),
                    work_dir: Some(format!("/xports/{port_dir}")),
                    timeout: None,
                },
                cancel,
            )
            .await;

        let result = match result {
            Ok(r) => r,
            Err(BuildError::Cancelled) => return Err(BuildError::Cancelled),
            Err(e) => {
                return Err(e);
            }
        };

        if result.exit_code != 0 {
            info!(port_dir, phase, exit_code = result.exit_code, "phase failed");
            return Ok(PhaseRunOutcome::Failed {
                phase: phase.to_string(),
                exit_code: result.exit_code,
            });
        }
    }

    Ok(PhaseRunOutcome::Success)
}
