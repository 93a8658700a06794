//! Worker environment: mount layout, chroot execution, teardown
//!
//! `WorkerBackend` is the three-operation interface the scheduler drives
//! (§9): `setup`, `execute`, `cleanup`, plus `get_base_path`. Only the BSD
//! chroot backend is real; a `fake` backend is registered for tests that
//! cannot run as root or on BSD (§8, concrete scenarios note).
//!
//! `cleanup`'s process-group kill has no safe wrapper in `nix` for sending a
//! signal to a negative (group) pid, so this module also carries
//! `#![allow(unsafe_code)]`, alongside `worker_helper`.

#![allow(unsafe_code)]

use crate::errors::{BuildError, Result};
use crate::mount::{resolve_source, MountDescriptor, MountMode};
use crate::retry::{retry_async, RetryConfig, RetryDecision};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Fixed mount-point subdirectories created under a worker's base directory
/// before any mounts happen (§4.5).
const WORKER_SUBDIRS: &[&str] = &[
    "usr", "boot", "bin", "sbin", "lib", "libexec",
    "usr/bin", "usr/include", "usr/lib", "usr/libdata", "usr/libexec",
    "usr/sbin", "usr/share", "usr/games", "usr/src", "usr/local",
    "xports", "options", "packages", "distfiles", "construction", "ccache", "tmp", "dev", "proc",
];

/// One system source directory mounted read-only via nullfs at worker setup.
#[derive(Debug, Clone)]
pub struct SystemMount {
    pub target: String,
    pub source: String,
}

/// Static configuration driving `WorkerBackend::setup`, derived from
/// `Config` plus the fixed layout rules of §4.5.
#[derive(Debug, Clone)]
pub struct WorkerSetupConfig {
    pub build_base: PathBuf,
    pub ports_dir: PathBuf,
    pub options_dir: PathBuf,
    pub packages_dir: PathBuf,
    pub distfiles_dir: PathBuf,
    pub ccache_dir: Option<PathBuf>,
    pub system_path: String,
    pub system_mounts: Vec<SystemMount>,
    pub use_usr_src: bool,
    pub construction_size_hint: Option<String>,
    pub localbase_size_hint: Option<String>,
}

/// A command to run inside the chroot (§4.5 `execute`).
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: Option<String>,
    pub timeout: Option<Duration>,
}

/// Outcome of one `execute` call (§4.5 result contract).
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub duration: Duration,
}

/// The three-operation interface the scheduler drives against a worker's
/// filesystem environment (§9 polymorphism over environments).
#[allow(async_fn_in_trait)]
pub trait WorkerBackend: Send + Sync {
    async fn setup(&mut self, worker_id: u32, cfg: &WorkerSetupConfig) -> Result<()>;
    /// Races the command's completion against `cancel`; returns
    /// `BuildError::Cancelled` if `cancel` fires first, without waiting for
    /// the command to exit on its own (§5/§8 cleanup-on-cancellation).
    async fn execute(&mut self, cmd: ExecConfig, cancel: &CancellationToken) -> Result<ExecResult>;
    async fn cleanup(&mut self) -> Result<()>;
    fn get_base_path(&self) -> Option<&Path>;
}

/// Constructs a worker backend by name: `"bsd"` for the real chroot
/// implementation, `"fake"` for the in-memory test double (§9).
pub fn create_backend(kind: &str) -> Result<Box<dyn WorkerBackend>> {
    match kind {
        "bsd" => Ok(Box::new(BsdWorkerEnv::new())),
        "fake" => Ok(Box::new(FakeWorkerEnv::new())),
        other => Err(BuildError::SetupFailed {
            op: "create_backend".to_string(),
            reason: format!("unknown worker backend: {other}"),
        }),
    }
}

/// Real BSD chroot-based worker environment.
pub struct BsdWorkerEnv {
    base_path: Option<PathBuf>,
    mounts: Vec<MountDescriptor>,
    tracked_pids: Vec<i32>,
}

impl BsdWorkerEnv {
    pub fn new() -> Self {
        BsdWorkerEnv {
            base_path: None,
            mounts: Vec::new(),
            tracked_pids: Vec::new(),
        }
    }

    fn base(&self) -> Result<&Path> {
        self.base_path.as_deref().ok_or_else(|| BuildError::SetupFailed {
            op: "base_path".to_string(),
            reason: "worker environment was never set up".to_string(),
        })
    }

    async fn mount_one(&mut self, descriptor: MountDescriptor) -> std::result::Result<(), String> {
        let status = Command::new("mount")
            .arg("-t")
            .arg(descriptor.fstype.to_string())
            .arg("-o")
            .arg(descriptor.options())
            .arg(&descriptor.source)
            .arg(&descriptor.target)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| e.to_string())?;

        if !status.status.success() {
            return Err(String::from_utf8_lossy(&status.stderr).to_string());
        }
        self.mounts.push(descriptor);
        Ok(())
    }

    async fn unmount_one(&self, target: &Path) -> std::result::Result<(), String> {
        let output = Command::new("umount")
            .arg(target)
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).to_string())
        }
    }
}

impl Default for BsdWorkerEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerBackend for BsdWorkerEnv {
    #[instrument(skip(self, cfg), fields(worker_id))]
    async fn setup(&mut self, worker_id: u32, cfg: &WorkerSetupConfig) -> Result<()> {
        let base = cfg.build_base.join(format!("SL{worker_id:02}"));
        std::fs::create_dir_all(&base)?;
        self.base_path = Some(base.clone());

        let mut failures = 0u32;

        macro_rules! attempt {
            ($descriptor:expr) => {{
                let descriptor = $descriptor;
                let target = descriptor.target.clone();
                if let Err(reason) = self.mount_one(descriptor).await {
                    failures += 1;
                    warn!(target = %target.display(), %reason, "mount failed during worker setup");
                }
            }};
        }

        attempt!(MountDescriptor::tmpfs(&base, None));

        for sub in WORKER_SUBDIRS {
            std::fs::create_dir_all(base.join(sub)).ok();
        }

        attempt!(MountDescriptor::tmpfs(base.join("boot"), None));
        attempt!(MountDescriptor::devfs(base.join("dev")));
        attempt!(MountDescriptor::procfs(base.join("proc")));

        for sys_mount in &cfg.system_mounts {
            let resolved = resolve_source(&sys_mount.source, &cfg.system_path);
            attempt!(MountDescriptor::nullfs(
                base.join(sys_mount.target.trim_start_matches('/')),
                resolved,
                MountMode::ReadOnly
            ));
        }

        if cfg.use_usr_src {
            let resolved = resolve_source("$/usr/src", &cfg.system_path);
            attempt!(MountDescriptor::nullfs(
                base.join("usr/src"),
                resolved,
                MountMode::ReadOnly
            ));
        }

        attempt!(MountDescriptor::nullfs(
            base.join("xports"),
            cfg.ports_dir.display().to_string(),
            MountMode::ReadOnly
        ));
        attempt!(MountDescriptor::nullfs(
            base.join("options"),
            cfg.options_dir.display().to_string(),
            MountMode::ReadWrite
        ));
        attempt!(MountDescriptor::nullfs(
            base.join("packages"),
            cfg.packages_dir.display().to_string(),
            MountMode::ReadWrite
        ));
        attempt!(MountDescriptor::nullfs(
            base.join("distfiles"),
            cfg.distfiles_dir.display().to_string(),
            MountMode::ReadWrite
        ));

        attempt!(MountDescriptor::tmpfs(
            base.join("construction"),
            cfg.construction_size_hint.as_deref()
        ));
        attempt!(MountDescriptor::tmpfs(
            base.join("usr/local"),
            cfg.localbase_size_hint.as_deref()
        ));

        if let Some(ccache_dir) = &cfg.ccache_dir {
            attempt!(MountDescriptor::nullfs(
                base.join("ccache"),
                ccache_dir.display().to_string(),
                MountMode::ReadWrite
            ));
        }

        let template = cfg.build_base.join("Template");
        if template.is_dir() {
            copy_dir_recursive(&template, &base).map_err(|e| BuildError::SetupFailed {
                op: "template_copy".to_string(),
                reason: e.to_string(),
            })?;
        }

        if failures > 0 {
            return Err(BuildError::SetupFailed {
                op: "mount".to_string(),
                reason: format!("{failures} mount(s) failed during setup"),
            });
        }
        Ok(())
    }

    #[instrument(skip(self, cmd, cancel))]
    async fn execute(&mut self, cmd: ExecConfig, cancel: &CancellationToken) -> Result<ExecResult> {
        let base = self.base()?.to_path_buf();
        let started = std::time::Instant::now();

        let self_exe = std::env::current_exe().map_err(|e| BuildError::ExecutionFailed {
            op: "execute".to_string(),
            command: cmd.command.clone(),
            reason: e.to_string(),
        })?;

        let mut helper = Command::new(self_exe);
        helper
            .arg("--worker-helper")
            .arg(format!("--chroot={}", base.display()));
        if let Some(wd) = &cmd.work_dir {
            helper.arg(format!("--workdir={wd}"));
        }
        if let Some(timeout) = cmd.timeout {
            helper.arg(format!("--timeout={}", timeout.as_secs()));
        }
        helper.arg("--");
        helper.arg(&cmd.command);
        helper.args(&cmd.args);
        for (k, v) in &cmd.env {
            helper.env(k, v);
        }

        let child = helper
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::ExecutionFailed {
                op: "spawn".to_string(),
                command: cmd.command.clone(),
                reason: e.to_string(),
            })?;

        if let Some(pid) = child.id() {
            self.tracked_pids.push(pid as i32);
        }

        tokio::select! {
            result = child.wait_with_output() => {
                let output = result.map_err(|e| BuildError::ExecutionFailed {
                    op: "wait".to_string(),
                    command: cmd.command.clone(),
                    reason: e.to_string(),
                })?;
                Ok(ExecResult {
                    exit_code: output.status.code().unwrap_or(-1),
                    duration: started.elapsed(),
                })
            }
            _ = cancel.cancelled() => {
                debug!(command = %cmd.command, "execute cancelled, leaving reaping to cleanup");
                Err(BuildError::Cancelled)
            }
        }
    }

    #[instrument(skip(self))]
    async fn cleanup(&mut self) -> Result<()> {
        for pid in self.tracked_pids.drain(..) {
            unsafe {
                libc::kill(-pid, libc::SIGTERM);
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        for pid in &self.tracked_pids {
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }

        let retry_cfg = RetryConfig::unmount_busy();
        let mut unmount_failures = 0u32;

        for descriptor in self.mounts.iter().rev() {
            let target = descriptor.target.clone();

            let result = retry_async(
                &retry_cfg,
                || {
                    let target = target.clone();
                    async move {
                        Command::new("umount")
                            .arg(&target)
                            .output()
                            .await
                            .map_err(|e| e.to_string())
                            .and_then(|o| {
                                if o.status.success() {
                                    Ok(())
                                } else {
                                    Err(String::from_utf8_lossy(&o.stderr).to_string())
                                }
                            })
                    }
                },
                |reason: &String| {
                    if reason.contains("busy") || reason.contains("EBUSY") {
                        RetryDecision::Retry
                    } else {
                        RetryDecision::Stop
                    }
                },
            )
            .await;

            if let Err(reason) = result {
                unmount_failures += 1;
                warn!(target = %target.display(), %reason, "unmount failed during cleanup");
            }
        }

        if unmount_failures == 0 {
            if let Some(base) = &self.base_path {
                if let Err(e) = std::fs::remove_dir_all(base) {
                    debug!(error = %e, "base directory removal failed (already gone is fine)");
                }
            }
        } else {
            warn!(unmount_failures, "skipping base directory removal due to unmount failures");
        }

        Ok(())
    }

    fn get_base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// In-memory test double used where the bsd backend can't run (no root, no
/// BSD mount syscalls) — records calls instead of touching the filesystem.
pub struct FakeWorkerEnv {
    base_path: Option<PathBuf>,
    pub setup_calls: u32,
    pub executed: Vec<ExecConfig>,
    pub cleanup_calls: u32,
    pub fail_command: Option<String>,
}

impl FakeWorkerEnv {
    pub fn new() -> Self {
        FakeWorkerEnv {
            base_path: None,
            setup_calls: 0,
            executed: Vec::new(),
            cleanup_calls: 0,
            fail_command: None,
        }
    }
}

impl Default for FakeWorkerEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerBackend for FakeWorkerEnv {
    async fn setup(&mut self, worker_id: u32, cfg: &WorkerSetupConfig) -> Result<()> {
        self.setup_calls += 1;
        self.base_path = Some(cfg.build_base.join(format!("SL{worker_id:02}")));
        Ok(())
    }

    async fn execute(&mut self, cmd: ExecConfig, cancel: &CancellationToken) -> Result<ExecResult> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let failed = self.fail_command.as_deref() == Some(cmd.command.as_str());
        self.executed.push(cmd);
        Ok(ExecResult {
            exit_code: if failed { 1 } else { 0 },
            duration: Duration::from_millis(1),
        })
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.cleanup_calls += 1;
        Ok(())
    }

    fn get_base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_config(build_base: &Path) -> WorkerSetupConfig {
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
    async fn fake_backend_tracks_setup_execute_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = FakeWorkerEnv::new();
        let cfg = setup_config(dir.path());

        env.setup(1, &cfg).await.unwrap();
        assert_eq!(env.setup_calls, 1);
        assert_eq!(env.get_base_path(), Some(dir.path().join("SL01").as_path()));

        let result = env
            .execute(
                ExecConfig {
                    command: "make".to_string(),
                    args: vec!["build".to_string()],
                    env: vec![],
                    work_dir: None,
                    timeout: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(env.executed.len(), 1);

        env.cleanup().await.unwrap();
        assert_eq!(env.cleanup_calls, 1);
    }

    #[tokio::test]
    async fn fake_backend_reports_configured_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = FakeWorkerEnv::new();
        env.fail_command = Some("make".to_string());
        env.setup(1, &setup_config(dir.path())).await.unwrap();

        let result = env
            .execute(
                ExecConfig {
                    command: "make".to_string(),
                    args: vec![],
                    env: vec![],
                    work_dir: None,
                    timeout: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn fake_backend_rejects_execute_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = FakeWorkerEnv::new();
        env.setup(1, &setup_config(dir.path())).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = env
            .execute(
                ExecConfig {
                    command: "make".to_string(),
                    args: vec![],
                    env: vec![],
                    work_dir: None,
                    timeout: None,
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn create_backend_rejects_unknown_kind() {
        let err = create_backend("windows").unwrap_err();
        assert!(matches!(err, BuildError::SetupFailed { .. }));
    }

    #[test]
    fn create_backend_accepts_fake_and_bsd() {
        assert!(create_backend("fake").is_ok());
        assert!(create_backend("bsd").is_ok());
    }
}
