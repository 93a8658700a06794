//! Port directory content fingerprint
//!
//! Deterministic CRC-32 of a port directory tree (§4.2): walk regular files
//! in lexical order of their relative path, feed the path bytes then the
//! file bytes into one running digest. Byte-stable across runs and machines
//! for the same tree.

use crate::errors::{BuildError, Result};
use crc32fast::Hasher;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Computes the CRC-32 fingerprint of `portdir`, per the rule in §4.2: all
/// regular files, sorted lexically by path relative to `portdir`, each
/// contributing its relative-path bytes then its file bytes.
#[instrument(skip(portdir), fields(portdir = %portdir.as_ref().display()))]
pub fn compute(portdir: impl AsRef<Path>) -> Result<u32> {
    let portdir = portdir.as_ref();
    let mut files = collect_regular_files(portdir)?;
    files.sort();

    let mut hasher = Hasher::new();
    for relative in &files {
        let full = portdir.join(relative);
        let bytes = std::fs::read(&full).map_err(|e| BuildError::CRCError {
            op: "read".to_string(),
            portdir: portdir.display().to_string(),
            reason: format!("{}: {e}", full.display()),
        })?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(&bytes);
    }

    Ok(hasher.finalize())
}

/// Walks `root` recursively, returning every regular file's path relative to
/// `root` (directories and non-regular entries are skipped, not descended
/// into specially — symlinked trees still get walked).
fn collect_regular_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| BuildError::CRCError {
        op: "readdir".to_string(),
        portdir: root.display().to_string(),
        reason: format!("{}: {e}", dir.display()),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| BuildError::CRCError {
            op: "readdir".to_string(),
            portdir: root.display().to_string(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| BuildError::CRCError {
            op: "stat".to_string(),
            portdir: root.display().to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;

        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn same_tree_yields_same_crc() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("Makefile"), "PORTNAME=foo\n");
        write_file(&dir.path().join("files/patch-a"), "diff\n");

        let a = compute(dir.path()).unwrap();
        let b = compute(dir.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn changed_content_changes_crc() {
        let dir = tempfile::tempdir().unwrap();
        let makefile = dir.path().join("Makefile");
        write_file(&makefile, "PORTNAME=foo\n");
        let before = compute(dir.path()).unwrap();

        write_file(&makefile, "PORTNAME=bar\n");
        let after = compute(dir.path()).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn crc_is_independent_of_directory_scan_order() {
        let dir1 = tempfile::tempdir().unwrap();
        write_file(&dir1.path().join("b.txt"), "b");
        write_file(&dir1.path().join("a.txt"), "a");

        let dir2 = tempfile::tempdir().unwrap();
        write_file(&dir2.path().join("a.txt"), "a");
        write_file(&dir2.path().join("b.txt"), "b");

        assert_eq!(compute(dir1.path()).unwrap(), compute(dir2.path()).unwrap());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let err = compute("/nonexistent/port/dir").unwrap_err();
        assert!(matches!(err, BuildError::CRCError { .. }));
    }
}
