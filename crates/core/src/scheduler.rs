//! Build orchestrator
//!
//! Drives the resolved port list through the worker pool (§4.8): a feeder
//! task walks the topological order pushing ready ports onto a bounded
//! channel, N worker tasks consume it and run the phase sequence, and a
//! shared cancellation token stops everything on signal or fatal error.

use crate::errors::Result;
use crate::phase::{run_phases, PhaseOptions, PhaseRunOutcome};
use crate::port::{PortId, PortRegistry, PortStatus};
use crate::stats::{RecordStatus, StatsCollector, Throttler};
use crate::store::{BuildRecord, BuildStatus, Store};
use crate::worker_env::{WorkerBackend, WorkerSetupConfig};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Poll interval for the feeder's dependency-readiness wait (§4.8 step 6,
/// §5 suspension point c).
const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the cancellation path waits for worker loops to exit before
/// proceeding to `cleanup` regardless (§4.8 Cancellation).
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sampling period for the load/swap ticker that drives `Throttler` and
/// refreshes the stats snapshot (§4.9).
const STATS_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval a worker uses while parked behind `dyn_max_workers` (§4.9:
/// gates dispatch from the ready queue, never tears down a running worker).
const THROTTLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Totals produced by one scheduler run (§4.8).
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
    pub ignored: u32,
    pub duration: Duration,
}

/// Configuration the scheduler needs beyond the resolved port list.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub slow_start: Option<usize>,
    pub phase_options: PhaseOptions,
    pub ports_root: String,
    pub force: bool,
}

/// Shared, read-locked registry handed to every worker task.
type SharedRegistry = Arc<Mutex<PortRegistry>>;

/// Runs the scheduler to completion over `topo_order`, returning totals.
/// `cancel` is owned by the caller (the `Service` facade's active-cleanup
/// slot) so a signal handler can cancel the run from outside.
#[instrument(skip(registry, store, stats, backend_factory, cfg, cancel))]
pub async fn run(
    registry: SharedRegistry,
    topo_order: Vec<PortId>,
    store: Arc<Store>,
    stats: Arc<StatsCollector>,
    backend_factory: impl Fn() -> Box<dyn WorkerBackend> + Send + Sync + 'static,
    setup_cfg: WorkerSetupConfig,
    cfg: SchedulerConfig,
    cancel: CancellationToken,
) -> Result<BuildStats> {
    let started = std::time::Instant::now();
    let mut build_stats = BuildStats::default();

    {
        let reg = registry.lock().await;
        for &id in &topo_order {
            let flags = reg.flags(id);
            match flags.status {
                PortStatus::Success | PortStatus::NoBuildIgnore => build_stats.skipped += 1,
                _ if flags.ignored.is_some() => build_stats.ignored += 1,
                _ => build_stats.total += 1,
            }
        }
    }

    let backend_factory = Arc::new(backend_factory);
    let worker_slots = cfg.slow_start.unwrap_or(cfg.worker_count).min(cfg.worker_count).max(1);

    let (tx, rx) = mpsc::channel::<PortId>(100);
    let rx = Arc::new(Mutex::new(rx));
    let active_workers = Arc::new(AtomicUsize::new(0));

    let feeder = tokio::spawn(feed(
        Arc::clone(&registry),
        topo_order.clone(),
        tx,
        cancel.clone(),
        Arc::clone(&store),
        Arc::clone(&stats),
        cfg.ports_root.clone(),
        cfg.force,
    ));

    let ticker_stop = CancellationToken::new();
    let ticker = tokio::spawn(run_stats_ticker(
        Arc::clone(&stats),
        Arc::clone(&active_workers),
        cfg.worker_count,
        cancel.clone(),
        ticker_stop.clone(),
    ));

    let mut workers = Vec::with_capacity(worker_slots);
    for worker_id in 0..worker_slots {
        let registry = Arc::clone(&registry);
        let store = Arc::clone(&store);
        let stats = Arc::clone(&stats);
        let rx = Arc::clone(&rx);
        let cancel = cancel.clone();
        let backend_factory = Arc::clone(&backend_factory);
        let setup_cfg = setup_cfg.clone();
        let ports_root = cfg.ports_root.clone();
        let phase_options = cfg.phase_options;
        let active_workers = Arc::clone(&active_workers);

        workers.push(tokio::spawn(async move {
            let mut backend = backend_factory();
            if let Err(e) = backend.setup(worker_id as u32, &setup_cfg).await {
                warn!(worker_id, error = %e, "worker setup failed, worker will not process any ports");
                return;
            }

            loop {
                while active_workers.load(Ordering::Relaxed) >= stats.snapshot().dyn_max_workers.max(1) {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tokio::time::sleep(THROTTLE_POLL_INTERVAL).await;
                }

                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    port = async {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    } => port,
                };

                let Some(port_id) = next else { break };

                active_workers.fetch_add(1, Ordering::Relaxed);
                run_one_port(
                    &registry,
                    &store,
                    &stats,
                    &mut *backend,
                    port_id,
                    worker_id as u32,
                    &ports_root,
                    phase_options,
                    &cancel,
                )
                .await;
                active_workers.fetch_sub(1, Ordering::Relaxed);
            }

            backend.cleanup().await.ok();
        }));
    }

    let _ = feeder.await;

    let drain = tokio::time::timeout(WORKER_DRAIN_TIMEOUT, async {
        for w in workers {
            let _ = w.await;
        }
    })
    .await;
    if drain.is_err() {
        warn!("worker drain timed out, proceeding to cleanup anyway");
        cancel.cancel();
    }

    ticker_stop.cancel();
    let _ = ticker.await;

    {
        let reg = registry.lock().await;
        build_stats.success = 0;
        build_stats.failed = 0;
        build_stats.skipped = 0;
        for &id in &topo_order {
            match reg.flags(id).status {
                PortStatus::Success => build_stats.success += 1,
                PortStatus::Failed => build_stats.failed += 1,
                PortStatus::Skipped | PortStatus::NoBuildIgnore => build_stats.skipped += 1,
                _ => {}
            }
        }
    }

    build_stats.duration = started.elapsed();
    Ok(build_stats)
}

/// Samples load/swap once per second, feeds `Throttler` to recompute
/// `dyn_max_workers`, and refreshes the rate/impulse/remaining snapshot via
/// `stats.tick()` (§4.9). Stops on either `cancel` (run aborted) or `stop`
/// (run completed normally).
async fn run_stats_ticker(
    stats: Arc<StatsCollector>,
    active_workers: Arc<AtomicUsize>,
    max_workers: usize,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let throttler = Throttler::new(false);
    let mut sys = System::new();
    let mut interval = tokio::time::interval(STATS_TICK_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        sys.refresh_memory();
        let load = System::load_average().one;
        let total_swap = sys.total_swap();
        let swap_percent = if total_swap == 0 {
            0.0
        } else {
            (sys.used_swap() as f64 / total_swap as f64) * 100.0
        };
        let dyn_max = throttler.sample(&sys, max_workers);

        stats.tick();
        stats.set_workers(active_workers.load(Ordering::Relaxed), dyn_max, load, swap_percent);
    }
}

/// Walks `topo_order`, pushing ports whose dependencies have all resolved
/// onto `tx` (§4.8 step 6). Closes `tx` when the walk completes.
async fn feed(
    registry: SharedRegistry,
    topo_order: Vec<PortId>,
    tx: mpsc::Sender<PortId>,
    cancel: CancellationToken,
    store: Arc<Store>,
    stats: Arc<StatsCollector>,
    ports_root: String,
    force: bool,
) {
    'outer: for &id in &topo_order {
        loop {
            if cancel.is_cancelled() {
                break 'outer;
            }

            enum Decision {
                AlreadyTerminal,
                DependencyFailed,
                StillWaiting,
                NeedsBuildCheck,
            }

            let decision = {
                let reg = registry.lock().await;
                let flags = reg.flags(id);
                if flags.status.is_terminal() || flags.pkg_manager_port {
                    Decision::AlreadyTerminal
                } else {
                    let deps: Vec<PortId> = reg.depends_on(id).iter().map(|e| e.provider).collect();
                    let mut all_ready = true;
                    let mut any_failed = false;
                    for dep in &deps {
                        match reg.flags(*dep).status {
                            PortStatus::Success => {}
                            PortStatus::Failed | PortStatus::Skipped => any_failed = true,
                            _ => all_ready = false,
                        }
                    }
                    if any_failed {
                        Decision::DependencyFailed
                    } else if all_ready {
                        Decision::NeedsBuildCheck
                    } else {
                        Decision::StillWaiting
                    }
                }
            };

            match decision {
                Decision::AlreadyTerminal => break,
                Decision::DependencyFailed => {
                    let mut reg = registry.lock().await;
                    reg.flags_mut(id).status = PortStatus::Skipped;
                    stats.record(crate::stats::RecordStatus::Skipped);
                    break;
                }
                Decision::NeedsBuildCheck => {
                    let portdir = registry.lock().await.get(id).portdir.clone();
                    let needs_build = if force {
                        true
                    } else {
                        let crc = crate::crc::compute(format!("{ports_root}/{portdir}")).ok();
                        match crc {
                            Some(c) => store.needs_build(&portdir, c).unwrap_or(true),
                            None => true,
                        }
                    };
                    if needs_build {
                        if tx.send(id).await.is_err() {
                            break 'outer;
                        }
                    } else {
                        let mut reg = registry.lock().await;
                        reg.flags_mut(id).status = PortStatus::Success;
                        stats.record(crate::stats::RecordStatus::Skipped);
                    }
                    break;
                }
                Decision::StillWaiting => {
                    tokio::time::sleep(DEPENDENCY_POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_port(
    registry: &SharedRegistry,
    store: &Store,
    stats: &StatsCollector,
    backend: &mut dyn WorkerBackend,
    port_id: PortId,
    worker_id: u32,
    ports_root: &str,
    phase_options: PhaseOptions,
    cancel: &CancellationToken,
) {
    let (portdir, version, flavor, installed_pkgfiles) = {
        let mut reg = registry.lock().await;
        reg.flags_mut(port_id).status = PortStatus::Running;
        let port = reg.get(port_id).clone();
        let pkgfiles = reg.successful_dependency_pkgfiles(port_id);
        (port.portdir.clone(), port.version.clone(), port.flavor.clone(), pkgfiles)
    };

    let build_uuid = Uuid::new_v4();
    let record = BuildRecord {
        uuid: build_uuid,
        portdir: portdir.clone(),
        version: version.clone(),
        status: BuildStatus::Running,
        start: Utc::now(),
        end: None,
        worker_id,
        last_phase: None,
    };
    if let Err(e) = store.insert_build(&record) {
        warn!(portdir, error = %e, "failed to write running build record");
    }

    let outcome = run_phases(backend, &portdir, flavor.as_deref(), &installed_pkgfiles, phase_options, cancel).await;

    let (final_status, record_status, last_phase) = match outcome {
        Ok(PhaseRunOutcome::Success) => (PortStatus::Success, BuildStatus::Success, None),
        Ok(PhaseRunOutcome::Failed { phase, .. }) => {
            (PortStatus::Failed, BuildStatus::Failed, Some(phase))
        }
        Err(e) if e.is_cancelled() => (PortStatus::Failed, BuildStatus::Failed, Some("cancelled".to_string())),
        Err(e) => {
            warn!(portdir, error = %e, "phase execution error");
            (PortStatus::Failed, BuildStatus::Failed, Some("execute".to_string()))
        }
    };

    {
        let mut reg = registry.lock().await;
        reg.flags_mut(port_id).status = final_status;
        reg.flags_mut(port_id).last_phase = last_phase.clone();
        reg.flags_mut(port_id).build_uuid = Some(build_uuid);
    }

    let terminal_record = BuildRecord {
        uuid: build_uuid,
        portdir: portdir.clone(),
        version: version.clone(),
        status: record_status,
        start: record.start,
        end: Some(Utc::now()),
        worker_id,
        last_phase,
    };

    match final_status {
        PortStatus::Success => {
            let crc = crate::crc::compute(format!("{ports_root}/{portdir}")).unwrap_or(0);
            if let Err(e) = store.commit_success(&terminal_record, crc) {
                warn!(portdir, error = %e, "post-success store update failed, artifact is still authoritative");
            }
            stats.record(RecordStatus::Success);
        }
        _ => {
            if let Err(e) = store.insert_build(&terminal_record) {
                warn!(portdir, error = %e, "failed to write terminal build record");
            }
            stats.record(RecordStatus::Failed);
        }
    }

    debug!(portdir, worker_id, status = ?final_status, "port build complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{compute_depths, link_edges, topo_order, TopoMode};
    use crate::port::{DepKind, Port};
    use crate::worker_env::FakeWorkerEnv;

    fn port(portdir: &str) -> Port {
        Port {
            portdir: portdir.to_string(),
            category: portdir.split('/').next().unwrap().to_string(),
            name: portdir.split('/').nth(1).unwrap().to_string(),
            flavor: None,
            version: "1.0".to_string(),
            pkgfile: format!("{}-1.0.pkg", portdir.replace('/', "_")),
            dep_fetch: String::new(),
            dep_extract: String::new(),
            dep_patch: String::new(),
            dep_build: String::new(),
            dep_lib: String::new(),
            dep_run: String::new(),
        }
    }

    fn setup_cfg(build_base: &std::path::Path) -> WorkerSetupConfig {
        WorkerSetupConfig {
            build_base: build_base.to_path_buf(),
            ports_dir: "/xports".into(),
            options_dir: "/options".into(),
            packages_dir: "/packages".into(),
            distfiles_dir: "/distfiles".into(),
            ccache_dir: None,
            system_path: "/".to_string(),
            system_mounts: vec![],
            use_usr_src: false,
            construction_size_hint: None,
            localbase_size_hint: None,
        }
    }

    #[tokio::test]
    async fn successful_leaf_build_updates_stats_and_status() {
        let mut reg = PortRegistry::new();
        let id = reg.insert(port("devel/pkgconf"));
        link_edges(&mut reg, "/xports");
        let depths = compute_depths(&reg);
        let order = topo_order(&reg, &depths, TopoMode::Strict).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("db")).unwrap());
        let stats = Arc::new(StatsCollector::new(1, 1));
        let registry = Arc::new(Mutex::new(reg));

        let build_stats = run(
            Arc::clone(&registry),
            order,
            store,
            stats,
            || Box::new(FakeWorkerEnv::new()),
            setup_cfg(dir.path()),
            SchedulerConfig {
                worker_count: 1,
                slow_start: None,
                phase_options: PhaseOptions::default(),
                ports_root: "/xports".to_string(),
                force: false,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(build_stats.success, 1);
        assert_eq!(build_stats.failed, 0);

        let reg = registry.lock().await;
        assert_eq!(reg.flags(id).status, PortStatus::Success);
    }

    #[tokio::test]
    async fn dependent_is_skipped_when_dependency_fails() {
        let mut reg = PortRegistry::new();
        let provider = reg.insert(port("devel/pkgconf"));
        let dependent = reg.insert(port("www/app"));
        reg.add_edge(dependent, provider, DepKind::Build);
        let depths = compute_depths(&reg);
        let order = topo_order(&reg, &depths, TopoMode::Strict).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("db")).unwrap());
        let stats = Arc::new(StatsCollector::new(2, 1));
        let registry = Arc::new(Mutex::new(reg));

        run(
            Arc::clone(&registry),
            order,
            store,
            stats,
            || {
                let mut env = FakeWorkerEnv::new();
                env.fail_command = Some("make".to_string());
                Box::new(env)
            },
            setup_cfg(dir.path()),
            SchedulerConfig {
                worker_count: 1,
                slow_start: None,
                phase_options: PhaseOptions::default(),
                ports_root: "/xports".to_string(),
                force: false,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let reg = registry.lock().await;
        assert_eq!(reg.flags(provider).status, PortStatus::Failed);
        assert_eq!(reg.flags(dependent).status, PortStatus::Skipped);
    }
}
