//! Mount descriptors for the worker chroot
//!
//! Describes the BSD mount layout populated by `worker_env::setup` (§4.5):
//! one `MountDescriptor` per mount point, tracked in insertion order so
//! teardown can unmount in reverse.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The BSD filesystem types this builder ever mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Tmpfs,
    Nullfs,
    Devfs,
    Procfs,
}

impl FromStr for FsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tmpfs" => Ok(FsType::Tmpfs),
            "nullfs" => Ok(FsType::Nullfs),
            "devfs" => Ok(FsType::Devfs),
            "procfs" => Ok(FsType::Procfs),
            other => Err(format!("unsupported fstype: {other}")),
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsType::Tmpfs => write!(f, "tmpfs"),
            FsType::Nullfs => write!(f, "nullfs"),
            FsType::Devfs => write!(f, "devfs"),
            FsType::Procfs => write!(f, "procfs"),
        }
    }
}

/// Whether a nullfs mount is writable from inside the chroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// One mount point tracked by a `WorkerEnv` (§3 Mount descriptor).
#[derive(Debug, Clone)]
pub struct MountDescriptor {
    pub target: PathBuf,
    pub fstype: FsType,
    pub source: String,
    pub mode: MountMode,
    /// `tmpfs`'s `-o size=` hint, `None` for unbounded / not applicable.
    pub size_hint: Option<String>,
}

impl MountDescriptor {
    pub fn tmpfs(target: impl Into<PathBuf>, size_hint: Option<&str>) -> Self {
        MountDescriptor {
            target: target.into(),
            fstype: FsType::Tmpfs,
            source: "tmpfs".to_string(),
            mode: MountMode::ReadWrite,
            size_hint: size_hint.map(str::to_string),
        }
    }

    pub fn devfs(target: impl Into<PathBuf>) -> Self {
        MountDescriptor {
            target: target.into(),
            fstype: FsType::Devfs,
            source: "devfs".to_string(),
            mode: MountMode::ReadWrite,
            size_hint: None,
        }
    }

    pub fn procfs(target: impl Into<PathBuf>) -> Self {
        MountDescriptor {
            target: target.into(),
            fstype: FsType::Procfs,
            source: "proc".to_string(),
            mode: MountMode::ReadWrite,
            size_hint: None,
        }
    }

    pub fn nullfs(target: impl Into<PathBuf>, source: impl Into<String>, mode: MountMode) -> Self {
        MountDescriptor {
            target: target.into(),
            fstype: FsType::Nullfs,
            source: source.into(),
            mode,
            size_hint: None,
        }
    }

    /// Mount-option string for this descriptor, as passed to `mount -t
    /// <fstype> -o <options> <source> <target>`.
    pub fn options(&self) -> String {
        let mut opts = Vec::new();
        if self.mode == MountMode::ReadOnly {
            opts.push("ro".to_string());
        }
        if let Some(size) = &self.size_hint {
            opts.push(format!("size={size}"));
        }
        if opts.is_empty() {
            "rw".to_string()
        } else {
            opts.join(",")
        }
    }
}

/// Resolves a configured system-path source string against `system_path`,
/// per the substitution rule in §4.5:
/// - `"dummy"` resolves to the literal `"tmpfs"`;
/// - a leading `$` is a system-path placeholder: dropped entirely when
///   `system_path == "/"`, otherwise replaced by `system_path`;
/// - any other source string is used verbatim.
pub fn resolve_source(source: &str, system_path: &str) -> String {
    if source == "dummy" {
        return "tmpfs".to_string();
    }
    if let Some(rest) = source.strip_prefix('$') {
        return if system_path == "/" {
            rest.to_string()
        } else {
            format!("{system_path}{rest}")
        };
    }
    source.to_string()
}
