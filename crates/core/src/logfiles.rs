//! Textual log file layout
//!
//! Mirrors terminal build outcomes into the fixed set of append-only files
//! under `Directory_logs` (§4.12, §6). This is a persisted user-facing
//! artifact distinct from `tracing`'s structured output — operators `tail`
//! these files directly.

use crate::errors::Result;
use crate::port::PortStatus;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::instrument;

const LAST_RESULTS: &str = "00_last_results.log";
const SUCCESS_LIST: &str = "01_success_list.log";
const FAILURE_LIST: &str = "02_failure_list.log";
const IGNORED_LIST: &str = "03_ignored_list.log";
const SKIPPED_LIST: &str = "04_skipped_list.log";
const ABNORMAL_OUTPUT: &str = "05_abnormal_command_output.log";
const OBSOLETE_PACKAGES: &str = "06_obsolete_packages.log";
const DEBUG: &str = "07_debug.log";

/// Append-only writer over the fixed `<LogsPath>/NN_name.log` layout.
pub struct LogFiles {
    dir: PathBuf,
}

impl LogFiles {
    #[instrument(skip(dir), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(LogFiles { dir })
    }

    fn append(&self, filename: &str, line: &str) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(filename))?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    /// Records one port's terminal outcome: always a line in
    /// `00_last_results`, plus one line in the status-specific list.
    pub fn record_outcome(&self, portdir: &str, status: PortStatus, last_phase: Option<&str>) -> Result<()> {
        let label = match status {
            PortStatus::Success => "success",
            PortStatus::Failed => "failed",
            PortStatus::Skipped => "skipped",
            PortStatus::NoBuildIgnore => "ignored",
            PortStatus::Running | PortStatus::Pending => "incomplete",
        };
        self.append(LAST_RESULTS, &format!("{portdir}: {label}"))?;

        match status {
            PortStatus::Success => self.append(SUCCESS_LIST, portdir)?,
            PortStatus::Failed => {
                let phase = last_phase.unwrap_or("unknown");
                self.append(FAILURE_LIST, &format!("{portdir}: {phase}"))?;
            }
            PortStatus::NoBuildIgnore => self.append(IGNORED_LIST, portdir)?,
            PortStatus::Skipped => self.append(SKIPPED_LIST, portdir)?,
            PortStatus::Running | PortStatus::Pending => {}
        }
        Ok(())
    }

    /// Appends raw command output from a failed phase for later inspection.
    pub fn record_abnormal_output(&self, portdir: &str, phase: &str, output: &str) -> Result<()> {
        self.append(ABNORMAL_OUTPUT, &format!("=== {portdir} ({phase}) ===\n{output}"))
    }

    /// Records a package file made obsolete by a rebuild (`cleanup`'s stale
    /// package sweep).
    pub fn record_obsolete_package(&self, pkgfile: &str) -> Result<()> {
        self.append(OBSOLETE_PACKAGES, pkgfile)
    }

    /// Appends a free-form debug line, independent of the `tracing` sink.
    pub fn record_debug(&self, message: &str) -> Result<()> {
        self.append(DEBUG, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_written_to_last_results_and_success_list() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogFiles::open(dir.path()).unwrap();
        logs.record_outcome("devel/pkgconf", PortStatus::Success, None).unwrap();

        let last = std::fs::read_to_string(dir.path().join(LAST_RESULTS)).unwrap();
        assert!(last.contains("devel/pkgconf: success"));
        let success = std::fs::read_to_string(dir.path().join(SUCCESS_LIST)).unwrap();
        assert!(success.contains("devel/pkgconf"));
    }

    #[test]
    fn failure_records_the_failing_phase() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogFiles::open(dir.path()).unwrap();
        logs.record_outcome("www/app", PortStatus::Failed, Some("build")).unwrap();

        let failure = std::fs::read_to_string(dir.path().join(FAILURE_LIST)).unwrap();
        assert!(failure.contains("www/app: build"));
    }

    #[test]
    fn entries_append_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogFiles::open(dir.path()).unwrap();
        logs.record_outcome("a/a", PortStatus::Success, None).unwrap();
        logs.record_outcome("b/b", PortStatus::Success, None).unwrap();

        let success = std::fs::read_to_string(dir.path().join(SUCCESS_LIST)).unwrap();
        assert_eq!(success.lines().count(), 2);
    }
}
