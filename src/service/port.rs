//! Port preemption: make sure nothing foreign is listening on a service's
//! port before it is launched.

use std::net::{Ipv4Addr, TcpListener};
use std::process::Command;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::SupervisorError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check if a port is available by attempting to bind then immediately releasing.
///
/// Both loopback and the wildcard address are tried since dev servers bind
/// either one.
pub fn is_port_free(port: u16) -> bool {
    [Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED]
        .into_iter()
        .all(|ip| TcpListener::bind((ip, port)).is_ok())
}

/// Pids listening on `port`, excluding this supervisor.
pub fn port_owners(port: u16) -> Vec<i32> {
    let lsof = match which::which("lsof") {
        Ok(path) => path,
        Err(_) => {
            log::warn!("lsof not found in PATH, cannot identify the owner of port {port}");
            return Vec::new();
        }
    };

    let output = Command::new(lsof)
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output();

    match output {
        Ok(output) => parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            log::warn!("Failed to run lsof for port {port}: {e}");
            Vec::new()
        }
    }
}

/// `lsof -t` prints one pid per line.
pub fn parse_lsof_pids(output: &str) -> Vec<i32> {
    let own = std::process::id() as i32;
    let mut pids: Vec<i32> = output
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0 && *pid != own)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Kill whatever listens on `port` and wait for the port to be released.
///
/// Returns the pids that were killed. Fails with `PortConflict` if the port
/// is still taken after `release_timeout`.
pub fn preempt_port(port: u16, release_timeout: Duration) -> Result<Vec<i32>, SupervisorError> {
    if is_port_free(port) {
        log::debug!("Port {port} is available");
        return Ok(Vec::new());
    }

    let pids = port_owners(port);
    for &pid in &pids {
        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => log::warn!("Port {port} was held by pid {pid}, sent SIGKILL"),
            Err(e) => log::warn!("Failed to SIGKILL pid {pid} holding port {port}: {e}"),
        }
    }

    let deadline = Instant::now() + release_timeout;
    while Instant::now() < deadline {
        if is_port_free(port) {
            return Ok(pids);
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    if is_port_free(port) {
        Ok(pids)
    } else {
        Err(SupervisorError::PortConflict { port, pids })
    }
}
