use anyhow::Result;
use clap::Parser;

mod cli;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("--worker-helper") {
        return run_worker_helper(&args[2..]);
    }

    let parsed = cli::Cli::parse();
    parsed.dispatch()
}

/// Entry point for the re-exec'd `--worker-helper` child (§4.5). Must be
/// intercepted before `Cli::parse()` runs — the flat `--chroot=... -- cmd
/// args...` argv this takes isn't a `clap` shape.
fn run_worker_helper(raw: &[String]) -> Result<()> {
    let args = parabuild_core::worker_helper::parse_helper_args(raw)?;
    let status = parabuild_core::worker_helper::run(args)?;
    std::process::exit(status.code().unwrap_or(1));
}
