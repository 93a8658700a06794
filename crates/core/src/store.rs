//! Persistent build store
//!
//! Crash-safe key/value persistence over `sled` (§4.1). Five named trees:
//! `builds` (uuid → record), `crc_index` (portdir → big-endian u32),
//! `package_index` (`portdir@version` → uuid), `build_runs` (run_id →
//! summary), `run_packages` (`run_id\0portdir@version` → per-run row), plus
//! `active_locks` (portdir → lease) used to recover from a crashed prior
//! process. `sled::Db::open` errors, `bincode` errors, and `uuid` parse
//! errors are all normalized into the typed taxonomy here; callers never see
//! a raw `sled::Error`.

use crate::errors::{BuildError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
    Skipped,
    Ignored,
}

/// Per-attempt row (§3 Build record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub uuid: Uuid,
    pub portdir: String,
    pub version: String,
    pub status: BuildStatus,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub worker_id: u32,
    pub last_phase: Option<String>,
}

/// One run's summary row (§3 Run summary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub aborted: bool,
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
    pub ignored: u32,
}

/// A per-run, per-package row keyed by `run_id + portdir@version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPackageRow {
    pub portdir: String,
    pub version: String,
    pub status: BuildStatus,
    pub build_uuid: Uuid,
}

/// A lease held by the currently-running builder for a portdir, recovered
/// via `clear_active_locks` if the previous process crashed mid-build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveLock {
    pub build_uuid: Uuid,
    pub worker_id: u32,
    pub acquired: DateTime<Utc>,
}

/// The crash-safe persistence layer (§4.1).
pub struct Store {
    builds: sled::Tree,
    crc_index: sled::Tree,
    package_index: sled::Tree,
    build_runs: sled::Tree,
    run_packages: sled::Tree,
    active_locks: sled::Tree,
    _db: Db,
}

impl Store {
    /// Opens (creating if absent) the sled database at `path`, and performs
    /// a one-time legacy CRC migration if `<legacy_crc_file>` is present
    /// alongside it.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| BuildError::database("open", None, e.to_string()))?;

        let builds = open_tree(&db, "builds")?;
        let crc_index = open_tree(&db, "crc_index")?;
        let package_index = open_tree(&db, "package_index")?;
        let build_runs = open_tree(&db, "build_runs")?;
        let run_packages = open_tree(&db, "run_packages")?;
        let active_locks = open_tree(&db, "active_locks")?;

        let store = Store {
            builds,
            crc_index,
            package_index,
            build_runs,
            run_packages,
            active_locks,
            _db: db,
        };

        store.migrate_legacy_crc_file(path)?;
        Ok(store)
    }

    /// Imports `<build_base>/crc_index` (one `portdir:8-hex-digit-crc` line
    /// each) into the `crc_index` tree on first open, then renames the file
    /// with a `.bak` suffix. A missing legacy file is not an error.
    fn migrate_legacy_crc_file(&self, db_path: &Path) -> Result<()> {
        let legacy_path = match db_path.parent() {
            Some(parent) => parent.join("crc_index"),
            None => return Ok(()),
        };
        if !legacy_path.is_file() {
            return Ok(());
        }

        let contents = std::fs::read_to_string(&legacy_path)?;
        let mut imported = 0u32;
        for line in contents.lines() {
            let Some((portdir, hex)) = line.split_once(':') else {
                continue;
            };
            if let Ok(crc) = u32::from_str_radix(hex.trim(), 16) {
                self.set_crc(portdir.trim(), crc)?;
                imported += 1;
            }
        }

        let backup_path = legacy_path.with_extension("bak");
        std::fs::rename(&legacy_path, &backup_path)?;
        debug!(imported, path = %legacy_path.display(), "migrated legacy crc_index file");
        Ok(())
    }

    #[instrument(skip(self, record))]
    pub fn insert_build(&self, record: &BuildRecord) -> Result<()> {
        if record.uuid.is_nil() {
            return Err(BuildError::EmptyUUID);
        }
        let bytes = bincode::serialize(record)
            .map_err(|e| BuildError::database("serialize", Some("builds".into()), e.to_string()))?;
        self.builds
            .insert(record.uuid.as_bytes(), bytes)
            .map_err(|e| BuildError::database("insert", Some("builds".into()), e.to_string()))?;
        Ok(())
    }

    pub fn get_build(&self, uuid: &Uuid) -> Result<BuildRecord> {
        let bytes = self
            .builds
            .get(uuid.as_bytes())
            .map_err(|e| BuildError::database("get", Some("builds".into()), e.to_string()))?
            .ok_or_else(|| BuildError::RecordNotFound(uuid.to_string()))?;
        bincode::deserialize(&bytes).map_err(|_| BuildError::CorruptedData("builds".to_string()))
    }

    /// `needs_build(portdir, current_crc)`: true if no entry exists, or the
    /// stored value differs from `current_crc` (§4.1, invariant 5 of §8).
    pub fn needs_build(&self, portdir: &str, current_crc: u32) -> Result<bool> {
        match self.get_crc(portdir)? {
            Some(stored) => Ok(stored != current_crc),
            None => Ok(true),
        }
    }

    pub fn get_crc(&self, portdir: &str) -> Result<Option<u32>> {
        let bytes = self
            .crc_index
            .get(portdir.as_bytes())
            .map_err(|e| BuildError::database("get", Some("crc_index".into()), e.to_string()))?;
        match bytes {
            Some(b) if b.len() == 4 => Ok(Some(u32::from_be_bytes(b.as_ref().try_into().unwrap()))),
            Some(_) => Err(BuildError::CorruptedData("crc_index".to_string())),
            None => Ok(None),
        }
    }

    pub fn set_crc(&self, portdir: &str, crc: u32) -> Result<()> {
        self.crc_index
            .insert(portdir.as_bytes(), &crc.to_be_bytes())
            .map_err(|e| BuildError::database("insert", Some("crc_index".into()), e.to_string()))?;
        Ok(())
    }

    pub fn set_package_index(&self, portdir: &str, version: &str, uuid: &Uuid) -> Result<()> {
        let key = format!("{portdir}@{version}");
        self.package_index
            .insert(key.as_bytes(), uuid.as_bytes())
            .map_err(|e| BuildError::database("insert", Some("package_index".into()), e.to_string()))?;
        Ok(())
    }

    /// `latest_for(portdir, version)`: looks up the package index, then the
    /// build record it points at.
    pub fn latest_for(&self, portdir: &str, version: &str) -> Result<Option<BuildRecord>> {
        let key = format!("{portdir}@{version}");
        let uuid_bytes = self
            .package_index
            .get(key.as_bytes())
            .map_err(|e| BuildError::database("get", Some("package_index".into()), e.to_string()))?;

        let Some(uuid_bytes) = uuid_bytes else {
            return Ok(None);
        };
        let uuid = Uuid::from_slice(&uuid_bytes).map_err(|e| BuildError::InvalidUUID(e.to_string()))?;

        match self.get_build(&uuid) {
            Ok(record) => Ok(Some(record)),
            Err(BuildError::RecordNotFound(_)) => Err(BuildError::OrphanedRecord(key)),
            Err(e) => Err(e),
        }
    }

    /// Atomically records a port's successful completion: build record
    /// update, CRC update, package-index update, in that order (§4.1).
    /// A failure partway through leaves a recoverable inconsistency that
    /// the caller logs rather than treats as fatal.
    #[instrument(skip(self, record))]
    pub fn commit_success(&self, record: &BuildRecord, crc: u32) -> Result<()> {
        self.insert_build(record)?;
        self.set_crc(&record.portdir, crc)?;
        self.set_package_index(&record.portdir, &record.version, &record.uuid)?;
        Ok(())
    }

    pub fn insert_run(&self, summary: &RunSummary) -> Result<()> {
        let bytes = bincode::serialize(summary)
            .map_err(|e| BuildError::database("serialize", Some("build_runs".into()), e.to_string()))?;
        self.build_runs
            .insert(summary.run_id.as_bytes(), bytes)
            .map_err(|e| BuildError::database("insert", Some("build_runs".into()), e.to_string()))?;
        Ok(())
    }

    pub fn insert_run_package(&self, run_id: &str, portdir_at_version: &str, row: &RunPackageRow) -> Result<()> {
        let mut key = run_id.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(portdir_at_version.as_bytes());
        let bytes = bincode::serialize(row)
            .map_err(|e| BuildError::database("serialize", Some("run_packages".into()), e.to_string()))?;
        self.run_packages
            .insert(key, bytes)
            .map_err(|e| BuildError::database("insert", Some("run_packages".into()), e.to_string()))?;
        Ok(())
    }

    pub fn acquire_lock(&self, portdir: &str, lock: &ActiveLock) -> Result<()> {
        let bytes = bincode::serialize(lock)
            .map_err(|e| BuildError::database("serialize", Some("active_locks".into()), e.to_string()))?;
        self.active_locks
            .insert(portdir.as_bytes(), bytes)
            .map_err(|e| BuildError::database("insert", Some("active_locks".into()), e.to_string()))?;
        Ok(())
    }

    pub fn release_lock(&self, portdir: &str) -> Result<()> {
        self.active_locks
            .remove(portdir.as_bytes())
            .map_err(|e| BuildError::database("remove", Some("active_locks".into()), e.to_string()))?;
        Ok(())
    }

    /// Drops every row in `active_locks`, returning the count dropped. Used
    /// at startup to recover from a previous process's crash.
    #[instrument(skip(self))]
    pub fn clear_active_locks(&self) -> Result<usize> {
        let count = self.active_locks.len();
        self.active_locks
            .clear()
            .map_err(|e| BuildError::database("clear", Some("active_locks".into()), e.to_string()))?;
        if count > 0 {
            warn!(count, "cleared stale active locks from a previous run");
        }
        Ok(count)
    }
}

fn open_tree(db: &Db, name: &str) -> Result<sled::Tree> {
    db.open_tree(name)
        .map_err(|e| BuildError::database("open_tree", Some(name.to_string()), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        (store, dir)
    }

    fn record(portdir: &str, status: BuildStatus) -> BuildRecord {
        BuildRecord {
            uuid: Uuid::new_v4(),
            portdir: portdir.to_string(),
            version: "1.0".to_string(),
            status,
            start: Utc::now(),
            end: Some(Utc::now()),
            worker_id: 0,
            last_phase: None,
        }
    }

    #[test]
    fn needs_build_is_true_when_no_entry_exists() {
        let (store, _dir) = test_store();
        assert!(store.needs_build("lang/rust", 123).unwrap());
    }

    #[test]
    fn needs_build_is_false_when_crc_matches() {
        let (store, _dir) = test_store();
        store.set_crc("lang/rust", 123).unwrap();
        assert!(!store.needs_build("lang/rust", 123).unwrap());
        assert!(store.needs_build("lang/rust", 456).unwrap());
    }

    #[test]
    fn commit_success_writes_all_three_stores() {
        let (store, _dir) = test_store();
        let rec = record("lang/rust", BuildStatus::Success);
        store.commit_success(&rec, 42).unwrap();

        assert_eq!(store.get_crc("lang/rust").unwrap(), Some(42));
        let latest = store.latest_for("lang/rust", "1.0").unwrap().unwrap();
        assert_eq!(latest.uuid, rec.uuid);
    }

    #[test]
    fn clear_active_locks_reports_count_and_empties() {
        let (store, _dir) = test_store();
        store
            .acquire_lock(
                "lang/rust",
                &ActiveLock {
                    build_uuid: Uuid::new_v4(),
                    worker_id: 1,
                    acquired: Utc::now(),
                },
            )
            .unwrap();
        let cleared = store.clear_active_locks().unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(store.clear_active_locks().unwrap(), 0);
    }

    #[test]
    fn get_build_missing_returns_typed_error() {
        let (store, _dir) = test_store();
        let err = store.get_build(&Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, BuildError::RecordNotFound(_)));
    }

    #[test]
    fn migrates_legacy_crc_file_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crc_index"), "lang/rust:0000007b\ndevel/cmake:000001c8\n").unwrap();

        let store = Store::open(dir.path().join("db")).unwrap();
        assert_eq!(store.get_crc("lang/rust").unwrap(), Some(0x7b));
        assert_eq!(store.get_crc("devel/cmake").unwrap(), Some(0x1c8));
        assert!(dir.path().join("crc_index.bak").is_file());
        assert!(!dir.path().join("crc_index").exists());
    }
}
