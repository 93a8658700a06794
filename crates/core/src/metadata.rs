//! Port metadata extraction via the ports Makefile query
//!
//! Invokes the external `make -V VAR` query per `(category, name, flavor)`
//! and classifies the result into one of the four outcomes described in
//! §4.3. Fan-out is gated by a `tokio::sync::Semaphore`, the same
//! concurrency-limit idiom this codebase uses elsewhere to bound parallel
//! child-process spawning.

use crate::port::Port;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// The fixed variable list queried from the ports Makefile, in the order
/// their values are expected back, one per line.
const QUERY_VARS: &[&str] = &[
    "PKGNAME",
    "PKGVERSION",
    "PKGFILE",
    "FETCH_DEPENDS",
    "EXTRACT_DEPENDS",
    "PATCH_DEPENDS",
    "BUILD_DEPENDS",
    "LIB_DEPENDS",
    "RUN_DEPENDS",
    "IGNORE",
];

/// Outcome of querying one port's metadata.
#[derive(Debug, Clone)]
pub enum MetadataOutcome {
    /// Full metadata captured successfully, with an ignore reason if the
    /// port sets `IGNORE`.
    Captured { port: Port, ignore_reason: Option<String> },
    /// The port directory does not exist.
    NotFound,
    /// The query failed to run, or returned fewer lines than expected.
    Corrupt { reason: String },
    /// The query ran but produced no package filename.
    Meta { port: Port },
}

/// Default concurrency for the metadata extractor's query fan-out, mirroring
/// this codebase's existing `cores/2` rule of thumb for bounding parallel
/// child-process spawning.
pub fn default_concurrency_limit() -> usize {
    (num_cpus::get().max(1) / 2).max(1)
}

/// Queries one port's metadata by invoking `make -V <vars>` inside
/// `portsdir/category/name`, with `FLAVOR=<flavor>` set when present.
#[instrument(skip(portsdir), fields(category, name, flavor))]
pub async fn query_port(
    portsdir: &Path,
    category: &str,
    name: &str,
    flavor: Option<&str>,
) -> MetadataOutcome {
    let port_path = portsdir.join(category).join(name);
    if !port_path.is_dir() {
        debug!(path = %port_path.display(), "port directory not found");
        return MetadataOutcome::NotFound;
    }

    let mut cmd = Command::new("make");
    cmd.current_dir(&port_path);
    for var in QUERY_VARS {
        cmd.arg("-V").arg(var);
    }
    if let Some(flavor) = flavor {
        cmd.arg(format!("FLAVOR={flavor}"));
    }

    let output = match cmd.output().await {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "make query failed to spawn");
            return MetadataOutcome::Corrupt {
                reason: format!("failed to execute make: {e}"),
            };
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return MetadataOutcome::Corrupt {
            reason: format!("make query exited non-zero: {stderr}"),
        };
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    if lines.len() < QUERY_VARS.len() {
        return MetadataOutcome::Corrupt {
            reason: format!(
                "expected {} lines, got {}",
                QUERY_VARS.len(),
                lines.len()
            ),
        };
    }

    let _pkgname = lines[0].trim();
    let version = lines[1].trim().to_string();
    let pkgfile_full = lines[2].trim();
    let dep_fetch = lines[3].trim().to_string();
    let dep_extract = lines[4].trim().to_string();
    let dep_patch = lines[5].trim().to_string();
    let dep_build = lines[6].trim().to_string();
    let dep_lib = lines[7].trim().to_string();
    let dep_run = lines[8].trim().to_string();
    let ignore = lines[9].trim();

    let portdir = match flavor {
        Some(f) => format!("{category}/{name}@{f}"),
        None => format!("{category}/{name}"),
    };

    // Strip leading path components: the Makefile query returns a full path.
    let pkgfile = pkgfile_full
        .rsplit('/')
        .next()
        .unwrap_or(pkgfile_full)
        .to_string();

    let ignore_reason = if ignore.is_empty() {
        None
    } else {
        Some(ignore.to_string())
    };

    let port = Port {
        portdir,
        category: category.to_string(),
        name: name.to_string(),
        flavor: flavor.map(str::to_string),
        version,
        pkgfile: pkgfile.clone(),
        dep_fetch,
        dep_extract,
        dep_patch,
        dep_build,
        dep_lib,
        dep_run,
    };

    if pkgfile.is_empty() {
        MetadataOutcome::Meta { port }
    } else {
        MetadataOutcome::Captured { port, ignore_reason }
    }
}

/// Dispatches metadata queries for `requests` over a semaphore-gated pool of
/// size `concurrency`, returning outcomes in the order results complete.
pub async fn query_all(
    portsdir: &Path,
    requests: Vec<(String, String, Option<String>)>,
    concurrency: usize,
) -> Vec<MetadataOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::with_capacity(requests.len());

    for (category, name, flavor) in requests {
        let portsdir = portsdir.to_path_buf();
        let semaphore = Arc::clone(&semaphore);
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            query_port(&portsdir, &category, &name, flavor.as_deref()).await
        }));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(outcome) => results.push(outcome),
            Err(e) => results.push(MetadataOutcome::Corrupt {
                reason: format!("query task panicked: {e}"),
            }),
        }
    }
    results
}
