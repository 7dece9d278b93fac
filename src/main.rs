mod cli;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use stackmond::config::{self, ShutdownOrder, SupervisorConfig};
use stackmond::manager::{self, RunMode, ServiceManager};
use stackmond::{shutdown, status};
use tokio::runtime::Runtime;

fn main() {
    // Initialize logger with custom format for the supervisor
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            eprintln!("The supervisor cannot start without an async runtime.");
            std::process::exit(1);
        }
    };
    if let Err(e) = real_main(&rt) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn real_main(rt: &Runtime) -> Result<()> {
    let args = cli::Args::parse();

    match args.sub.unwrap_or(cli::Cmd::Run {
        config: None,
        monitor_only: false,
        no_dashboard: false,
        forward_shutdown: false,
    }) {
        cli::Cmd::Run {
            config,
            monitor_only,
            no_dashboard,
            forward_shutdown,
        } => run_supervisor(
            rt,
            config,
            monitor_only || cli::monitor_only_from_env(),
            no_dashboard,
            forward_shutdown,
        ),
        cli::Cmd::Check { config } => handle_check(rt, config),
        cli::Cmd::Init { path, force } => handle_init(&path, force),
    }
}

/// Resolve, read and anchor the configuration.
fn load_config(explicit: Option<PathBuf>) -> Result<SupervisorConfig> {
    match config::discover_config_path(explicit) {
        Some(path) => {
            let mut cfg = SupervisorConfig::load(&path)?;
            let absolute = std::path::absolute(&path)
                .with_context(|| format!("Failed to resolve {}", path.display()))?;
            if let Some(base) = absolute.parent() {
                cfg.anchor_to(base);
            }
            info!("Using config from: {}", absolute.display());
            Ok(cfg)
        }
        None => {
            let mut cfg = SupervisorConfig::default();
            let cwd = std::env::current_dir().context("Failed to read working directory")?;
            cfg.anchor_to(&cwd);
            Ok(cfg)
        }
    }
}

fn run_supervisor(
    rt: &Runtime,
    config_path: Option<PathBuf>,
    monitor_only: bool,
    no_dashboard: bool,
    forward_shutdown: bool,
) -> Result<()> {
    let mut cfg = load_config(config_path)?;
    if no_dashboard {
        cfg.supervisor.dashboard = false;
    }
    if forward_shutdown {
        cfg.supervisor.shutdown_order = ShutdownOrder::Forward;
    }
    let mode = if monitor_only {
        RunMode::MonitorOnly
    } else {
        RunMode::Supervise
    };

    shutdown::install_signal_handlers()?;
    let mgr = ServiceManager::new(&cfg, rt.handle().clone(), mode)?;

    info!("stackmond started (pid {})", std::process::id());
    // blocks this thread; service I/O runs on the runtime's workers
    let last = mgr.run()?;
    for svc in &last.services {
        info!(
            "{}: {} after {} spawn(s), {} restart(s) counted",
            svc.name, svc.status, svc.spawns, svc.restarts
        );
    }
    info!("stackmond exiting");
    Ok(())
}

/// Probe every service once (Exit 0 = all healthy, 1 = otherwise)
fn handle_check(rt: &Runtime, config_path: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config_path)?;
    let snapshot = rt.block_on(manager::check_once(&cfg))?;
    print!("{}", status::render(&snapshot));
    if !snapshot.all_healthy() {
        std::process::exit(1);
    }
    Ok(())
}

/// Write the built-in service table as a starting configuration.
fn handle_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let default_toml = toml::to_string_pretty(&SupervisorConfig::default())
        .context("Failed to serialize default config")?;
    fs::write(path, default_toml).context("Failed to write config file")?;

    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
