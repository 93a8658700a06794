//! `--worker-helper` sub-invocation
//!
//! The process the parent launches to actually run a command inside a
//! worker's chroot (§4.5). On FreeBSD/DragonFly it acquires reaper status
//! via `procctl(PROC_REAP_ACQUIRE)` so every descendant it accumulates —
//! including ones reparented away from a dying direct child — gets killed
//! on `PROC_REAP_KILL` rather than leaking past the scheduler's view of the
//! process tree. Everywhere else reaper acquisition is a no-op: orphans are
//! instead caught by the `/proc` sweep in `worker_env::cleanup`.
//!
//! Entering a chroot and registering as a reaper are both raw syscalls with
//! no safe wrapper in `nix` for this combination, and `CommandExt::pre_exec`
//! itself requires an `unsafe` closure; `worker_env`'s process-group kill in
//! `cleanup` carries the same allowance for the same reason.

#![allow(unsafe_code)]

use crate::errors::{BuildError, Result};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Parsed arguments for one `--worker-helper` invocation.
#[derive(Debug, Clone)]
pub struct HelperArgs {
    pub chroot: std::path::PathBuf,
    pub workdir: Option<String>,
    pub timeout: Option<Duration>,
    pub command: String,
    pub args: Vec<String>,
}

/// Registers the current process as a reaper on platforms that support it
/// (`PROC_REAP_ACQUIRE` on FreeBSD/DragonFly). A no-op elsewhere.
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
fn acquire_reaper() {
    unsafe {
        let ret = libc::procctl(
            libc::P_PID,
            0,
            libc::PROC_REAP_ACQUIRE,
            std::ptr::null_mut(),
        );
        if ret != 0 {
            warn!(errno = std::io::Error::last_os_error().raw_os_error(), "failed to acquire reaper status");
        }
    }
}

#[cfg(not(any(target_os = "freebsd", target_os = "dragonfly")))]
fn acquire_reaper() {
    debug!("reaper acquisition is a no-op on this platform");
}

/// Kills every descendant of the current reaper (`PROC_REAP_KILL`). A no-op
/// on platforms without reaper support — orphans there are caught by the
/// `/proc` sweep in `worker_env::cleanup` instead.
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
fn reap_kill() {
    unsafe {
        let mut kill_params: libc::procctl_reaper_kill_params = std::mem::zeroed();
        kill_params.rk_sig = libc::SIGKILL;
        let ret = libc::procctl(
            libc::P_PID,
            0,
            libc::PROC_REAP_KILL,
            &mut kill_params as *mut _ as *mut libc::c_void,
        );
        if ret != 0 {
            warn!(errno = std::io::Error::last_os_error().raw_os_error(), "reap kill failed");
        }
    }
}

#[cfg(not(any(target_os = "freebsd", target_os = "dragonfly")))]
fn reap_kill() {}

/// Runs `args.command` inside `args.chroot`, chdir'd to `args.workdir` if
/// given, with reaper status held for the duration. The chdir happens
/// inside the chroot, after `chroot()` and before `exec()` (§4.5, §9
/// resolved open question); a chdir failure fails the exec before the
/// target command ever runs.
#[instrument(skip(args), fields(chroot = %args.chroot.display(), command = %args.command))]
pub fn run(args: HelperArgs) -> Result<ExitStatus> {
    acquire_reaper();

    let chroot = args.chroot.clone();
    let workdir = args.workdir.clone();

    let mut cmd = Command::new(&args.command);
    cmd.args(&args.args);

    unsafe {
        cmd.pre_exec(move || {
            chroot_and_chdir(&chroot, workdir.as_deref())
        });
    }

    let mut child = cmd.spawn().map_err(|e| BuildError::ExecutionFailed {
        op: "spawn".to_string(),
        command: args.command.clone(),
        reason: e.to_string(),
    })?;

    let status = if let Some(timeout) = args.timeout {
        wait_with_timeout(&mut child, timeout)?
    } else {
        child.wait().map_err(|e| BuildError::ExecutionFailed {
            op: "wait".to_string(),
            command: args.command.clone(),
            reason: e.to_string(),
        })?
    };

    reap_kill();
    Ok(status)
}

/// Runs inside the forked child, before `exec`. Must only call
/// async-signal-safe functions.
fn chroot_and_chdir(chroot: &Path, workdir: Option<&str>) -> std::io::Result<()> {
    let chroot_cstr = std::ffi::CString::new(chroot.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    let ret = unsafe { libc::chroot(chroot_cstr.as_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let target = workdir.unwrap_or("/");
    let target_cstr = std::ffi::CString::new(target)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let ret = unsafe { libc::chdir(target_cstr.as_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

fn wait_with_timeout(child: &mut std::process::Child, timeout: Duration) -> Result<ExitStatus> {
    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(|e| BuildError::ExecutionFailed {
            op: "try_wait".to_string(),
            command: "worker-helper".to_string(),
            reason: e.to_string(),
        })? {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BuildError::Timeout);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Parses the flat `--worker-helper --chroot=... --workdir=... [--timeout=...] -- cmd args...`
/// argument vector (everything after the literal `--worker-helper` token).
pub fn parse_helper_args(raw: &[String]) -> Result<HelperArgs> {
    let mut chroot = None;
    let mut workdir = None;
    let mut timeout = None;
    let mut idx = 0;

    while idx < raw.len() {
        let arg = &raw[idx];
        if arg == "--" {
            idx += 1;
            break;
        } else if let Some(v) = arg.strip_prefix("--chroot=") {
            chroot = Some(std::path::PathBuf::from(v));
        } else if let Some(v) = arg.strip_prefix("--workdir=") {
            workdir = Some(v.to_string());
        } else if let Some(v) = arg.strip_prefix("--timeout=") {
            timeout = v.parse::<u64>().ok().map(Duration::from_secs);
        } else {
            return Err(BuildError::ValidationError {
                field: "worker-helper argument".to_string(),
                value: Some(arg.clone()),
            });
        }
        idx += 1;
    }

    let chroot = chroot.ok_or_else(|| BuildError::ValidationError {
        field: "--chroot".to_string(),
        value: None,
    })?;
    let rest = &raw[idx..];
    let command = rest.first().cloned().ok_or_else(|| BuildError::ValidationError {
        field: "command".to_string(),
        value: None,
    })?;
    let args = rest[1..].to_vec();

    Ok(HelperArgs {
        chroot,
        workdir,
        timeout,
        command,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_full_argument_set() {
        let parsed = parse_helper_args(&args(&[
            "--chroot=/build/SL00",
            "--workdir=/construction/foo",
            "--timeout=30",
            "--",
            "make",
            "build",
        ]))
        .unwrap();

        assert_eq!(parsed.chroot, Path::new("/build/SL00"));
        assert_eq!(parsed.workdir.as_deref(), Some("/construction/foo"));
        assert_eq!(parsed.timeout, Some(Duration::from_secs(30)));
        assert_eq!(parsed.command, "make");
        assert_eq!(parsed.args, vec!["build".to_string()]);
    }

    #[test]
    fn workdir_and_timeout_are_optional() {
        let parsed = parse_helper_args(&args(&["--chroot=/build/SL00", "--", "make"])).unwrap();
        assert!(parsed.workdir.is_none());
        assert!(parsed.timeout.is_none());
    }

    #[test]
    fn missing_chroot_is_an_error() {
        let err = parse_helper_args(&args(&["--", "make"])).unwrap_err();
        assert!(matches!(err, BuildError::ValidationError { .. }));
    }

    #[test]
    fn missing_command_is_an_error() {
        let err = parse_helper_args(&args(&["--chroot=/build/SL00", "--"])).unwrap_err();
        assert!(matches!(err, BuildError::ValidationError { .. }));
    }
}
