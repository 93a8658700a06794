//! Configuration loading
//!
//! This module is deliberately thin: it locates the INI configuration file,
//! parses it with the `ini` crate, merges a named profile section over the
//! `"Global Configuration"` fallback section, coerces each key to its typed
//! field, and applies derived path defaults. It does not interpret build
//! semantics — the orchestrator and worker environment own that.

use crate::errors::{BuildError, Result};
use ini::Ini;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

const GLOBAL_SECTION: &str = "Global Configuration";

/// Fully resolved configuration for one run, after section/global merging,
/// type coercion, and derived-path defaulting.
#[derive(Debug, Clone)]
pub struct Config {
    pub directory_buildbase: PathBuf,
    pub directory_portsdir: PathBuf,
    pub directory_repository: PathBuf,
    pub directory_packages: PathBuf,
    pub directory_distfiles: PathBuf,
    pub directory_options: PathBuf,
    pub directory_logs: PathBuf,
    pub directory_ccache: PathBuf,
    pub directory_system: PathBuf,

    pub number_of_builders: usize,
    pub max_jobs_per_builder: usize,

    pub tmpfs_workdir: bool,
    pub tmpfs_localbase: bool,
    pub use_ccache: bool,
    pub display_with_ncurses: bool,

    pub database_path: PathBuf,
    pub migration_auto_migrate: bool,
    pub migration_backup_legacy: bool,
    pub database_auto_vacuum: bool,
}

impl Config {
    /// Load configuration from an INI file, reading keys from `profile`
    /// (falling back to `"Global Configuration"` for any key `profile` does
    /// not set).
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>, profile: &str) -> Result<Self> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path).map_err(|e| BuildError::ConfigurationNotFound {
            path: format!("{}: {e}", path.display()),
        })?;

        let get = |key: &str| -> Option<String> {
            ini.section(Some(profile))
                .and_then(|s| s.get(key))
                .or_else(|| ini.section(Some(GLOBAL_SECTION)).and_then(|s| s.get(key)))
                .map(|v| v.to_string())
        };

        let get_path = |key: &str, default: &str| -> PathBuf {
            PathBuf::from(get(key).unwrap_or_else(|| default.to_string()))
        };

        let default_builders = num_cpus::get().min(16);

        let buildbase = get_path("Directory_buildbase", "/usr/build");

        let number_of_builders = get("Number_of_builders")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(default_builders);

        let max_jobs_per_builder = get("Max_jobs_per_builder")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1);

        let cfg = Config {
            directory_portsdir: get_path("Directory_portsdir", "/xports"),
            directory_repository: get_path("Directory_repository", "/repository"),
            directory_packages: get("Directory_packages")
                .map(PathBuf::from)
                .unwrap_or_else(|| buildbase.join("packages")),
            directory_distfiles: get("Directory_distfiles")
                .map(PathBuf::from)
                .unwrap_or_else(|| buildbase.join("distfiles")),
            directory_options: get("Directory_options")
                .map(PathBuf::from)
                .unwrap_or_else(|| buildbase.join("options")),
            directory_logs: get("Directory_logs")
                .map(PathBuf::from)
                .unwrap_or_else(|| buildbase.join("logs")),
            directory_ccache: get("Directory_ccache")
                .map(PathBuf::from)
                .unwrap_or_else(|| buildbase.join("ccache")),
            directory_system: get_path("Directory_system", "/"),
            directory_buildbase: buildbase,

            number_of_builders,
            max_jobs_per_builder,

            tmpfs_workdir: parse_bool(get("Tmpfs_workdir"), true),
            tmpfs_localbase: parse_bool(get("Tmpfs_localbase"), true),
            use_ccache: parse_bool(get("Use_ccache"), false),
            display_with_ncurses: parse_bool(get("Display_with_ncurses"), false),

            database_path: get_path("Database_path", "/usr/build/db"),
            migration_auto_migrate: parse_bool(get("Migration_auto_migrate"), true),
            migration_backup_legacy: parse_bool(get("Migration_backup_legacy"), true),
            database_auto_vacuum: parse_bool(get("Database_auto_vacuum"), false),
        };

        debug!(builders = cfg.number_of_builders, "configuration loaded");
        Ok(cfg)
    }
}

/// Parses the INI boolean vocabulary: `true`/`false`, `yes`/`no`, `1`/`0`,
/// `on`/`off`, case-insensitively. Unparseable values fall back to `default`
/// with a warning rather than failing the whole config load.
fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value {
        None => default,
        Some(v) => match v.to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => true,
            "false" | "no" | "0" | "off" => false,
            other => {
                warn!(value = other, "unrecognized boolean value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn falls_back_to_global_section() {
        let f = write_ini(
            "[Global Configuration]\nDirectory_buildbase = /build\nNumber_of_builders = 4\n\n[myprofile]\nUse_ccache = yes\n",
        );
        let cfg = Config::load(f.path(), "myprofile").unwrap();
        assert_eq!(cfg.directory_buildbase, PathBuf::from("/build"));
        assert_eq!(cfg.number_of_builders, 4);
        assert!(cfg.use_ccache);
    }

    #[test]
    fn profile_overrides_global() {
        let f = write_ini(
            "[Global Configuration]\nNumber_of_builders = 4\n\n[myprofile]\nNumber_of_builders = 8\n",
        );
        let cfg = Config::load(f.path(), "myprofile").unwrap();
        assert_eq!(cfg.number_of_builders, 8);
    }

    #[test]
    fn derives_package_dir_from_buildbase() {
        let f = write_ini("[Global Configuration]\nDirectory_buildbase = /opt/synth\n");
        let cfg = Config::load(f.path(), "myprofile").unwrap();
        assert_eq!(cfg.directory_packages, PathBuf::from("/opt/synth/packages"));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool(Some("YES".into()), false));
        assert!(parse_bool(Some("On".into()), false));
        assert!(!parse_bool(Some("0".into()), true));
        assert_eq!(parse_bool(None, true), true);
    }
}
