//! Process-lifetime service facade
//!
//! `Service` is the one process-wide handle (§9 global mutable state): it
//! owns the store, the stats collector, and an `active cleanup` slot the
//! signal handler consults to cancel an in-flight run. The CLI layer creates
//! one `Service` at entry and destroys it before exit; every subcommand
//! dispatches through a method here rather than touching the lower modules
//! directly.

use crate::bootstrap::{bootstrap_pkg_manager, PKG_MANAGER_PORTDIR};
use crate::config::Config;
use crate::crc;
use crate::dependency::{compute_depths, link_edges, topo_order, TopoMode};
use crate::errors::Result;
use crate::logfiles::LogFiles;
use crate::metadata::{default_concurrency_limit, query_all, MetadataOutcome};
use crate::phase::PhaseOptions;
use crate::port::{PortId, PortRegistry};
use crate::scheduler::{self, BuildStats, SchedulerConfig};
use crate::stats::StatsCollector;
use crate::store::{BuildRecord, Store};
use crate::worker_env::{create_backend, SystemMount, WorkerSetupConfig};
use indexmap::IndexSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Options a subcommand gathers from CLI flags before invoking [`Service::build`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ports: Vec<String>,
    pub force: bool,
    pub slow_start: Option<usize>,
    pub check_plist: bool,
    pub worker_backend: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            ports: Vec::new(),
            force: false,
            slow_start: None,
            check_plist: false,
            worker_backend: "bsd".to_string(),
        }
    }
}

/// Process-wide handle created at CLI entry (§9).
pub struct Service {
    pub config: Config,
    pub store: Arc<Store>,
    pub stats: Arc<StatsCollector>,
    active_cleanup: Arc<Mutex<Option<CancellationToken>>>,
}

impl Service {
    /// Removes the on-disk database directory entirely (`reset-db`). Must
    /// be called before any `Service` holding that path is constructed —
    /// `sled` requires exclusive access to its directory while open.
    pub fn reset_database(config: &Config) -> Result<()> {
        if config.database_path.exists() {
            std::fs::remove_dir_all(&config.database_path)?;
        }
        Ok(())
    }

    #[instrument(skip(config))]
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(Store::open(&config.database_path)?);
        let cleared = store.clear_active_locks()?;
        if cleared > 0 {
            warn!(cleared, "recovered from a previous process's crash");
        }
        let stats = Arc::new(StatsCollector::new(0, config.number_of_builders));
        Ok(Service {
            config,
            store,
            stats,
            active_cleanup: Arc::new(Mutex::new(None)),
        })
    }

    /// Creates the on-disk directory tree (`init`). Idempotent: re-running
    /// on an already-initialized tree is a no-op per directory.
    #[instrument(skip(self))]
    pub fn init(&self) -> Result<()> {
        for dir in [
            &self.config.directory_buildbase,
            &self.config.directory_packages,
            &self.config.directory_distfiles,
            &self.config.directory_options,
            &self.config.directory_logs,
            &self.config.directory_ccache,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::create_dir_all(self.config.directory_packages.join("All"))?;
        std::fs::create_dir_all(self.config.directory_buildbase.join("Template"))?;
        info!(buildbase = %self.config.directory_buildbase.display(), "build tree initialized");
        Ok(())
    }

    /// Signal handlers call this to cancel whichever run is currently
    /// registered in the active-cleanup slot, if any (§9).
    pub async fn request_cancel(&self) {
        if let Some(token) = self.active_cleanup.lock().await.as_ref() {
            token.cancel();
        }
    }

    /// Expands `requested` port specs into a fully resolved dependency graph
    /// by iteratively querying metadata until no new provider is discovered
    /// (§4.3, §4.4). Ports already present in the store with a matching CRC
    /// are still included — the scheduler decides needs-build, not resolve.
    #[instrument(skip(self, requested))]
    pub async fn resolve(&self, requested: &[String]) -> Result<(PortRegistry, Vec<PortId>)> {
        let mut registry = PortRegistry::new();
        let mut seen: IndexSet<String> = IndexSet::new();
        let mut frontier: Vec<(String, String, Option<String>)> = Vec::new();

        for spec in requested {
            let (category, name, flavor) = split_portdir(spec);
            let key = canonical_key(&category, &name, flavor.as_deref());
            if seen.insert(key) {
                frontier.push((category, name, flavor));
            }
        }

        let portsdir = self.config.directory_portsdir.clone();
        let portsdir_str = portsdir.to_string_lossy().to_string();

        while !frontier.is_empty() {
            let batch = std::mem::take(&mut frontier);
            let outcomes = query_all(&portsdir, batch, default_concurrency_limit()).await;

            for outcome in outcomes {
                let port = match outcome {
                    MetadataOutcome::Captured { port, ignore_reason } => {
                        let id = registry.insert(port.clone());
                        if let Some(reason) = ignore_reason {
                            registry.flags_mut(id).ignored = Some(reason);
                        }
                        if port.portdir == PKG_MANAGER_PORTDIR {
                            registry.flags_mut(id).pkg_manager_port = true;
                        }
                        Some(port)
                    }
                    MetadataOutcome::Meta { port } => {
                        let id = registry.insert(port.clone());
                        registry.flags_mut(id).meta = true;
                        Some(port)
                    }
                    MetadataOutcome::NotFound => {
                        warn!("requested port directory not found");
                        None
                    }
                    MetadataOutcome::Corrupt { reason } => {
                        warn!(reason, "port metadata query failed");
                        None
                    }
                };

                let Some(port) = port else { continue };
                for dep_string in [
                    &port.dep_fetch,
                    &port.dep_extract,
                    &port.dep_patch,
                    &port.dep_build,
                    &port.dep_lib,
                    &port.dep_run,
                ] {
                    for token in crate::dependency::parse_dep_string(dep_string, &portsdir_str) {
                        if seen.insert(token.portdir.clone()) {
                            let (category, name, flavor) = split_portdir(&token.portdir);
                            frontier.push((category, name, flavor));
                        }
                    }
                }
            }
        }

        link_edges(&mut registry, &portsdir_str);
        let depths = compute_depths(&registry);
        let order = topo_order(&registry, &depths, TopoMode::Strict)?;
        Ok((registry, order))
    }

    /// Runs `init → resolve → bootstrap → scheduler` for `opts.ports` and
    /// mirrors the outcome into the textual log file layout (§4.12, §6).
    #[instrument(skip(self, opts))]
    pub async fn build(&self, opts: RunOptions) -> Result<BuildStats> {
        let (registry, order) = self.resolve(&opts.ports).await?;
        let registry = Arc::new(Mutex::new(registry));

        let setup_cfg = self.worker_setup_config();

        let cancel = CancellationToken::new();
        *self.active_cleanup.lock().await = Some(cancel.clone());

        if registry.lock().await.lookup(PKG_MANAGER_PORTDIR).is_some() {
            let crc = crc::compute(
                self.config
                    .directory_portsdir
                    .join(PKG_MANAGER_PORTDIR),
            )
            .unwrap_or(0);
            let bootstrap_result = match create_backend(&opts.worker_backend) {
                Ok(mut backend) => {
                    bootstrap_pkg_manager(
                        &self.config.directory_buildbase.join("Template"),
                        &self.config.directory_packages,
                        &self.store,
                        crc,
                        &setup_cfg,
                        backend.as_mut(),
                        &cancel,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match bootstrap_result {
                Ok(outcome) => info!(?outcome, "pkg manager bootstrap complete"),
                Err(e) => {
                    *self.active_cleanup.lock().await = None;
                    return Err(e);
                }
            }
        }

        let backend_kind = opts.worker_backend.clone();
        let scheduler_cfg = SchedulerConfig {
            worker_count: self.config.number_of_builders,
            slow_start: opts.slow_start,
            phase_options: PhaseOptions {
                check_plist_enabled: opts.check_plist,
            },
            ports_root: self.config.directory_portsdir.to_string_lossy().to_string(),
            force: opts.force,
        };

        let stats = Arc::clone(&self.stats);
        let store = Arc::clone(&self.store);

        let result = scheduler::run(
            Arc::clone(&registry),
            order,
            store,
            stats,
            move || create_backend(&backend_kind).expect("worker backend kind validated at startup"),
            setup_cfg,
            scheduler_cfg,
            cancel,
        )
        .await;

        *self.active_cleanup.lock().await = None;
        let build_stats = result?;

        if let Ok(logs) = LogFiles::open(&self.config.directory_logs) {
            let reg = registry.lock().await;
            for id in reg.ids() {
                let port = reg.get(id);
                let flags = reg.flags(id);
                logs.record_outcome(&port.portdir, flags.status, flags.last_phase.as_deref())
                    .ok();
            }
        }

        Ok(build_stats)
    }

    /// Looks up the latest build record for each requested port (`status`).
    /// `version` comes from a metadata query since the store indexes by
    /// `portdir@version`, not `portdir` alone.
    #[instrument(skip(self))]
    pub async fn status(&self, ports: &[String]) -> Vec<(String, Option<BuildRecord>)> {
        let mut out = Vec::with_capacity(ports.len());
        for spec in ports {
            let (category, name, flavor) = split_portdir(spec);
            let portdir = canonical_key(&category, &name, flavor.as_deref());
            let outcome = crate::metadata::query_port(
                &self.config.directory_portsdir,
                &category,
                &name,
                flavor.as_deref(),
            )
            .await;
            let record = match outcome {
                MetadataOutcome::Captured { port, .. } | MetadataOutcome::Meta { port } => {
                    self.store.latest_for(&portdir, &port.version).ok().flatten()
                }
                _ => None,
            };
            out.push((portdir, record));
        }
        out
    }

    /// Drops every active lock left by a crashed previous process
    /// (`cleanup`), returning the count dropped.
    pub fn cleanup(&self) -> Result<usize> {
        self.store.clear_active_locks()
    }

    fn worker_setup_config(&self) -> WorkerSetupConfig {
        WorkerSetupConfig {
            build_base: self.config.directory_buildbase.clone(),
            ports_dir: self.config.directory_portsdir.clone(),
            options_dir: self.config.directory_options.clone(),
            packages_dir: self.config.directory_packages.clone(),
            distfiles_dir: self.config.directory_distfiles.clone(),
            ccache_dir: if self.config.use_ccache {
                Some(self.config.directory_ccache.clone())
            } else {
                None
            },
            system_path: self.config.directory_system.to_string_lossy().to_string(),
            system_mounts: vec![
                SystemMount { target: "bin".to_string(), source: "bin".to_string() },
                SystemMount { target: "sbin".to_string(), source: "sbin".to_string() },
                SystemMount { target: "lib".to_string(), source: "lib".to_string() },
                SystemMount { target: "libexec".to_string(), source: "libexec".to_string() },
                SystemMount { target: "usr/bin".to_string(), source: "usr/bin".to_string() },
                SystemMount { target: "usr/include".to_string(), source: "usr/include".to_string() },
                SystemMount { target: "usr/lib".to_string(), source: "usr/lib".to_string() },
                SystemMount { target: "usr/libdata".to_string(), source: "usr/libdata".to_string() },
                SystemMount { target: "usr/libexec".to_string(), source: "usr/libexec".to_string() },
                SystemMount { target: "usr/sbin".to_string(), source: "usr/sbin".to_string() },
                SystemMount { target: "usr/share".to_string(), source: "usr/share".to_string() },
                SystemMount { target: "usr/games".to_string(), source: "usr/games".to_string() },
            ],
            use_usr_src: false,
            construction_size_hint: if self.config.tmpfs_workdir { Some("4g".to_string()) } else { None },
            localbase_size_hint: if self.config.tmpfs_localbase { Some("2g".to_string()) } else { None },
        }
    }
}

/// Splits `category/name[@flavor]` into its parts. Anything lacking a `/`
/// is treated as an invalid spec and returned verbatim as the category with
/// an empty name, surfaced by the caller's later `NotFound` outcome.
fn split_portdir(spec: &str) -> (String, String, Option<String>) {
    let (path, flavor) = match spec.split_once('@') {
        Some((p, f)) => (p, Some(f.to_string())),
        None => (spec, None),
    };
    match path.split_once('/') {
        Some((category, name)) => (category.to_string(), name.to_string(), flavor),
        None => (path.to_string(), String::new(), flavor),
    }
}

fn canonical_key(category: &str, name: &str, flavor: Option<&str>) -> String {
    match flavor {
        Some(f) => format!("{category}/{name}@{f}"),
        None => format!("{category}/{name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_category_name_and_flavor() {
        assert_eq!(
            split_portdir("devel/pkgconf"),
            ("devel".to_string(), "pkgconf".to_string(), None)
        );
        assert_eq!(
            split_portdir("lang/python@py39"),
            ("lang".to_string(), "python".to_string(), Some("py39".to_string()))
        );
    }

    #[test]
    fn canonical_key_round_trips_flavor() {
        assert_eq!(canonical_key("lang", "python", Some("py39")), "lang/python@py39");
        assert_eq!(canonical_key("devel", "pkgconf", None), "devel/pkgconf");
    }

    #[tokio::test]
    async fn resolve_returns_empty_graph_for_missing_port() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("db")).unwrap();
        let config = Config {
            directory_buildbase: dir.path().to_path_buf(),
            directory_portsdir: dir.path().join("xports"),
            directory_repository: dir.path().join("repository"),
            directory_packages: dir.path().join("packages"),
            directory_distfiles: dir.path().join("distfiles"),
            directory_options: dir.path().join("options"),
            directory_logs: dir.path().join("logs"),
            directory_ccache: dir.path().join("ccache"),
            directory_system: "/".into(),
            number_of_builders: 1,
            max_jobs_per_builder: 1,
            tmpfs_workdir: true,
            tmpfs_localbase: true,
            use_ccache: false,
            display_with_ncurses: false,
            database_path: dir.path().join("db").join("store"),
            migration_auto_migrate: true,
            migration_backup_legacy: true,
            database_auto_vacuum: false,
        };
        std::fs::create_dir_all(&config.directory_portsdir).unwrap();

        let service = Service::new(config).unwrap();
        let (registry, order) = service.resolve(&["devel/nonexistent".to_string()]).await.unwrap();
        assert!(registry.is_empty());
        assert!(order.is_empty());
    }
}
