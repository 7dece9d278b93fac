use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "local development stack supervisor")]
pub struct Args {
    /// Sub‑commands (run, check, init)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Launch and supervise every service (default if no sub‑command)
    Run {
        /// Path to configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Only probe and display already running services (also MONITOR_ONLY=1)
        #[arg(long)]
        monitor_only: bool,

        /// Log status lines instead of redrawing the dashboard
        #[arg(long)]
        no_dashboard: bool,

        /// Stop services in registry order instead of reverse order
        #[arg(long)]
        forward_shutdown: bool,
    },
    /// Probe every service once (Exit 0 = all healthy, 1 = otherwise)
    Check {
        /// Path to configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
    /// Write the default configuration file
    Init {
        /// Where to write it
        #[arg(long, default_value = stackmond::config::CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// `MONITOR_ONLY=1|true` turns monitor-only mode on without the flag.
pub fn monitor_only_from_env() -> bool {
    std::env::var("MONITOR_ONLY").is_ok_and(|raw| parse_flag(&raw).unwrap_or(false))
}

/// `1`/`true`/`yes` (any case) enable, `0`/`false`/`no`/empty disable.
fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected true/false or 1/0, got `{other}`")),
    }
}
