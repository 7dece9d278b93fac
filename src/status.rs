//! StatusReporter: periodic read-only rendering of supervisor state.

use std::fmt::Write as _;
use std::io::{self, Write as _};
use std::time::Duration;

use chrono::{DateTime, Local};
use colored::Colorize;
use crossterm::{cursor::MoveTo, execute, terminal::Clear, terminal::ClearType};

use crate::config::QuickLink;
use crate::state_machine::State;

const RULE_WIDTH: usize = 60;

/// Point-in-time copy of one service's runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub name: String,
    pub display_name: String,
    pub status: State,
    pub url: String,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub max_restarts: u32,
    /// Processes spawned for this service during the run.
    pub spawns: u32,
    pub last_change: DateTime<Local>,
    /// Most recent passing probe.
    pub last_healthy: Option<DateTime<Local>>,
}

/// Consistent view of the whole supervisor, taken between two events.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub uptime: Duration,
    pub services: Vec<ServiceSnapshot>,
    pub links: Vec<QuickLink>,
    pub monitor_only: bool,
    pub shutting_down: bool,
    /// Ports cleared by the final sweep, set once the supervisor stopped.
    pub swept_ports: Vec<u16>,
}

impl StatusSnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn all_healthy(&self) -> bool {
        self.services.iter().all(|s| s.status == State::Healthy)
    }
}

/// `1h 2m 3s`
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn status_cell(status: State) -> (&'static str, colored::ColoredString) {
    let label = format!("{:<10}", status.as_str().to_uppercase());
    match status {
        State::Healthy => ("✅", label.green()),
        State::Starting => ("🟡", label.yellow()),
        State::Unhealthy => ("⚠️", label.yellow()),
        State::Stopped => ("❌", label.red()),
        State::Crashed => ("💥", label.red().bold()),
    }
}

/// Render the status table. Colour follows `colored`'s global control.
pub fn render(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    let rule = "=".repeat(RULE_WIDTH);

    let _ = writeln!(out, "{}", "🌱 Stack Supervisor".bold().green());
    let _ = writeln!(out, "{rule}");
    let mode = if snapshot.shutting_down {
        "  (shutting down)"
    } else if snapshot.monitor_only {
        "  (monitor-only)"
    } else {
        ""
    };
    let _ = writeln!(
        out,
        "{}{mode}",
        format!("⏱️ Uptime: {}", format_uptime(snapshot.uptime)).cyan()
    );
    let _ = writeln!(out);

    for svc in &snapshot.services {
        let (icon, label) = status_cell(svc.status);
        let pid = svc
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let _ = writeln!(
            out,
            "{icon} {:<20} {label} {:<26} pid {:<7} restarts {}/{}  since {}",
            svc.display_name,
            svc.url,
            pid,
            svc.restarts,
            svc.max_restarts,
            svc.last_change.format("%H:%M:%S"),
        );
        if svc.status == State::Crashed {
            let _ = writeln!(
                out,
                "   {}",
                "restart budget exhausted, restart the supervisor to retry".red()
            );
        }
    }

    if !snapshot.links.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "📊 Quick Links:".bold());
        for link in &snapshot.links {
            let _ = writeln!(out, "   {:<10} {}", format!("{}:", link.label), link.url);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "💡 Press Ctrl+C to stop all services");
    let _ = writeln!(out, "{rule}");
    out
}

/// Draws snapshots either as a full-screen dashboard or as log lines.
#[derive(Debug, Clone, Copy)]
pub struct StatusReporter {
    dashboard: bool,
}

impl StatusReporter {
    pub fn new(dashboard: bool) -> Self {
        Self { dashboard }
    }

    pub fn report(&self, snapshot: &StatusSnapshot) -> io::Result<()> {
        if !self.dashboard {
            for svc in &snapshot.services {
                log::info!(
                    "status: {} {} ({}) restarts {}/{} uptime {}",
                    svc.name,
                    svc.status,
                    svc.url,
                    svc.restarts,
                    svc.max_restarts,
                    format_uptime(snapshot.uptime)
                );
            }
            return Ok(());
        }

        let mut stdout = io::stdout().lock();
        execute!(stdout, Clear(ClearType::All), MoveTo(0, 0))?;
        stdout.write_all(render(snapshot).as_bytes())?;
        stdout.flush()
    }
}
