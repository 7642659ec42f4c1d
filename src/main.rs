use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

use restuned::config::Config;
use restuned::resource::{ResourceBuilder, ResourceRegistry};
use restuned::server::Server;
use restuned::target::TargetRegistry;
use restuned::Shutdown;

/// restuned: arbitrates concurrent client requests to tune system
/// resources (CPU governors, scheduler knobs, cgroup controllers, generic
/// sysfs nodes).
///
/// Clients send short-lived tune/retune/untune requests; the daemon
/// decides, per resource, which value is currently applied, honoring both
/// per-resource policy and per-request priority, and automatically reverts
/// changes when requests expire or clients die.
#[derive(Debug, Parser)]
struct Opts {
    /// Path to the TOML configuration file. Defaults apply if omitted.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print version and exit.
    #[clap(long)]
    version: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("restuned {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let config = Config::load(opts.config.as_deref())?;

    let mut registry = ResourceRegistry::new();
    for res in &config.resources {
        let descriptor = ResourceBuilder::new(res.name.clone(), res.code)
            .path(res.path.clone())
            .bounds(res.low, res.high)
            .permissions(res.permissions)
            .modes(res.modes)
            .apply_type(res.apply_type)
            .policy(res.policy)
            .unit(res.unit)
            .build()
            .with_context(|| format!("Bad resource config {:#010x}", res.code))?;
        debug!("Registered {:?}", descriptor);
        registry.register(descriptor)?;
    }
    info!("Loaded {} resources from config", registry.len());

    let targets = TargetRegistry::probe(&config.sysfs_root, &config.cgroup_ids)
        .context("Failed to probe CPU topology")?;
    info!(
        "Host layout: {} cores, {} clusters",
        targets.nr_cores(),
        targets.nr_clusters()
    );

    let mut server = Server::new(config, Arc::new(registry), Arc::new(targets))?;

    let sigint = Arc::new(Shutdown::new());
    let handler = Arc::clone(&sigint);
    ctrlc::set_handler(move || {
        handler.trigger();
    })
    .context("Error setting Ctrl-C handler")?;

    info!("restuned ready");
    sigint.wait();
    if let Ok(state) = server.snapshot_json() {
        debug!("State at shutdown: {}", state);
    }
    server.shutdown();
    Ok(())
}
