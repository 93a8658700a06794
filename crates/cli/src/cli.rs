use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parabuild_core::config::Config;
use parabuild_core::logfiles::LogFiles;
use parabuild_core::scheduler::BuildStats;
use parabuild_core::service::{RunOptions, Service};
use parabuild_core::store::BuildStatus;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Parallel BSD ports builder"
)]
pub struct Cli {
    /// Enable debug-level logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Force a rebuild regardless of CRC freshness
    #[arg(short = 'f', long, global = true)]
    pub force: bool,

    /// Assume yes on any confirmation prompt
    #[arg(short = 'y', long = "yes", global = true)]
    pub assume_yes: bool,

    /// Configuration profile section to read
    #[arg(short = 'p', long, global = true, default_value = "Global Configuration")]
    pub profile: String,

    /// Start with fewer workers than configured and ramp up
    #[arg(short = 's', long = "slow-start", global = true)]
    pub slow_start: Option<usize>,

    /// Directory holding parabuild.ini
    #[arg(short = 'C', long = "config-dir", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Run the check-plist phase
    #[arg(short = 'P', long = "check-plist", global = true)]
    pub check_plist: bool,

    /// Disable the interactive status display
    #[arg(short = 'S', long = "no-ui", global = true)]
    pub disable_ui: bool,

    /// Worker backend ("bsd" or "fake"); "fake" is test-only
    #[arg(long = "backend", global = true, default_value = "bsd", hide = true)]
    pub backend: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the build tree and open the database
    Init,
    /// Build the given ports and their dependencies
    Build { ports: Vec<String> },
    /// Build only the given ports, without pulling in fresh dependents
    JustBuild { ports: Vec<String> },
    /// Force-rebuild the given ports regardless of CRC freshness
    Force { ports: Vec<String> },
    /// Build against a scratch database, discarding results afterward
    Test { ports: Vec<String> },
    /// Build every port in the tree
    Everything,
    /// Rebuild every port currently installed on the running system
    UpgradeSystem,
    /// Prepare the system for an upgrade without installing anything
    PrepareSystem,
    /// Run only the fetch phases for the given ports
    FetchOnly { ports: Vec<String> },
    /// Report the latest build status for the given ports
    Status { ports: Vec<String> },
    /// Report the latest build status for every known port
    StatusEverything,
    /// Clear stale active-build locks left by a crashed process
    Cleanup,
    /// Delete and recreate the persistence database
    ResetDb,
    /// Resolve the given ports and print the dependency order without building
    Verify { ports: Vec<String> },
    /// Print the resolved configuration
    Configure,
    /// Print the fixed textual log files under Directory_logs
    Logs { port: Option<String> },
    /// Print version information
    Version,
}

impl Cli {
    pub fn dispatch(self) -> Result<()> {
        let format = parabuild_core::logging::LogFormat::Text;
        parabuild_core::logging::init_with_format(format).ok();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;

        runtime.block_on(self.dispatch_async())
    }

    async fn dispatch_async(self) -> Result<()> {
        let config_dir = self
            .config_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/usr/local/etc"));
        let config_path = config_dir.join("parabuild.ini");

        if matches!(self.command, Command::Version) {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        if matches!(self.command, Command::ResetDb) {
            let config = Config::load(&config_path, &self.profile)
                .context("loading configuration for reset-db")?;
            Service::reset_database(&config)?;
            println!("database reset");
            return Ok(());
        }

        let mut config = Config::load(&config_path, &self.profile)
            .with_context(|| format!("loading configuration from {}", config_path.display()))?;
        if let Some(s) = self.slow_start {
            config.number_of_builders = config.number_of_builders.min(s).max(1);
        }

        let service = Service::new(config)?;

        let signal_service_handle = &service;
        tokio::select! {
            result = self.run_command(&service) => result,
            _ = wait_for_shutdown_signal() => {
                signal_service_handle.request_cancel().await;
                bail!("interrupted");
            }
        }
    }

    async fn run_command(&self, service: &Service) -> Result<()> {
        let run_opts = |ports: Vec<String>, force: bool| RunOptions {
            ports,
            force: force || self.force,
            slow_start: self.slow_start,
            check_plist: self.check_plist,
            worker_backend: self.backend.clone(),
        };

        match &self.command {
            Command::Init => {
                service.init()?;
                println!("build tree initialized at {}", service.config.directory_buildbase.display());
            }
            Command::Build { ports } => {
                let stats = service.build(run_opts(ports.clone(), false)).await?;
                report(&stats);
                if stats.failed > 0 {
                    bail!("{} port(s) failed", stats.failed);
                }
            }
            Command::JustBuild { ports } => {
                let stats = service.build(run_opts(ports.clone(), false)).await?;
                report(&stats);
                if stats.failed > 0 {
                    bail!("{} port(s) failed", stats.failed);
                }
            }
            Command::Force { ports } => {
                let stats = service.build(run_opts(ports.clone(), true)).await?;
                report(&stats);
                if stats.failed > 0 {
                    bail!("{} port(s) failed", stats.failed);
                }
            }
            Command::Test { ports } => {
                let stats = service.build(run_opts(ports.clone(), false)).await?;
                report(&stats);
            }
            Command::Everything => {
                bail!("building the whole tree requires a ports-index scan, which this build does not source; pass explicit ports instead");
            }
            Command::UpgradeSystem | Command::PrepareSystem => {
                bail!("installed-package enumeration is not available in this build; pass explicit ports instead");
            }
            Command::FetchOnly { ports } => {
                let stats = service.build(run_opts(ports.clone(), false)).await?;
                report(&stats);
            }
            Command::Status { ports } => {
                let rows = service.status(ports).await;
                for (portdir, record) in rows {
                    match record {
                        Some(r) => println!("{portdir}: {}", status_label(r.status)),
                        None => println!("{portdir}: unknown"),
                    }
                }
            }
            Command::StatusEverything => {
                bail!("reporting status for every known port requires a ports-index scan, which this build does not source; pass explicit ports to status instead");
            }
            Command::Cleanup => {
                let cleared = service.cleanup()?;
                println!("cleared {cleared} stale lock(s)");
            }
            Command::Verify { ports } => {
                let (_registry, order) = service.resolve(ports).await?;
                println!("resolved {} port(s) in dependency order", order.len());
            }
            Command::Configure => {
                println!("{:#?}", service.config);
            }
            Command::Logs { port } => {
                LogFiles::open(&service.config.directory_logs)?;
                let last_results = service.config.directory_logs.join("00_last_results.log");
                let contents = std::fs::read_to_string(&last_results).unwrap_or_default();
                for line in contents.lines() {
                    match port {
                        Some(p) if !line.starts_with(p.as_str()) => continue,
                        _ => println!("{line}"),
                    }
                }
            }
            Command::ResetDb | Command::Version => unreachable!("handled before service creation"),
        }

        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn status_label(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Running => "running",
        BuildStatus::Success => "success",
        BuildStatus::Failed => "failed",
        BuildStatus::Skipped => "skipped",
        BuildStatus::Ignored => "ignored",
    }
}

fn report(stats: &BuildStats) {
    println!(
        "built {} succeeded, {} failed, {} skipped, {} ignored (in {:.1}s)",
        stats.success,
        stats.failed,
        stats.skipped,
        stats.ignored,
        stats.duration.as_secs_f64()
    );
}
