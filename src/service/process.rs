use std::borrow::Cow;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;

/// How a stopped process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateOutcome {
    pub code: Option<i32>,
    /// The grace period ran out and SIGKILL was needed.
    pub forced: bool,
}

/// Gracefully shutdown a service process.
///
/// 1. SIGTERM to the child's process group
/// 2. wait up to `grace` for it to exit
/// 3. escalate to SIGKILL and wait up to `kill_timeout`
///
/// Never waits longer than `grace + kill_timeout`.
pub async fn terminate_gracefully(
    name: &str,
    child: &mut Child,
    grace: Duration,
    kill_timeout: Duration,
) -> TerminateOutcome {
    let Some(pid) = child.id() else {
        // already reaped
        let code = child.try_wait().ok().flatten().and_then(|s| s.code());
        return TerminateOutcome { code, forced: false };
    };

    signal_group(name, pid, nix::sys::signal::Signal::SIGTERM);

    let start = tokio::time::Instant::now();
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            log::info!(
                "{} exited gracefully in {:.2}s: {}",
                name,
                start.elapsed().as_secs_f64(),
                status
            );
            return TerminateOutcome {
                code: status.code(),
                forced: false,
            };
        }
        Ok(Err(e)) => {
            log::warn!("Graceful wait error for {name}: {e}");
        }
        Err(_) => {
            log::warn!("{name} graceful shutdown timeout ({grace:?}), escalating to SIGKILL");
        }
    }

    signal_group(name, pid, nix::sys::signal::Signal::SIGKILL);
    if let Err(e) = child.start_kill() {
        log::debug!("start_kill on {name}: {e}");
    }

    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(Ok(status)) => {
            log::warn!("{name} terminated by SIGKILL: {status}");
            TerminateOutcome {
                code: status.code(),
                forced: true,
            }
        }
        Ok(Err(e)) => {
            log::error!("SIGKILL wait failed for {name}: {e}");
            TerminateOutcome {
                code: None,
                forced: true,
            }
        }
        Err(_) => {
            log::error!("{name} did not respond to SIGKILL after {kill_timeout:?} (PID: {pid})");
            TerminateOutcome {
                code: None,
                forced: true,
            }
        }
    }
}

/// Signal the whole process group the child leads, falling back to the
/// child alone.
fn signal_group(name: &str, pid: u32, sig: nix::sys::signal::Signal) {
    use nix::sys::signal;
    use nix::unistd::Pid;

    let nix_pid = Pid::from_raw(pid as i32);
    match signal::killpg(nix_pid, sig) {
        Ok(()) => log::info!("Sent {sig} to {name} (PGID: {pid})"),
        Err(group_err) => match signal::kill(nix_pid, sig) {
            Ok(()) => log::info!("Sent {sig} to {name} (PID: {pid})"),
            Err(e) => log::warn!("Failed {sig} to {name}: {group_err} / {e}"),
        },
    }
}

/// Which child stream a forwarder reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Decides which child output lines reach the log and how long they may be.
#[derive(Debug, Clone, Default)]
pub struct OutputFilter {
    quiet_patterns: Vec<String>,
    line_limit: usize,
}

impl OutputFilter {
    pub fn new(quiet_patterns: Vec<String>, line_limit: usize) -> Self {
        Self {
            quiet_patterns,
            line_limit,
        }
    }

    /// `None` when the line is blank or matches a quiet pattern.
    pub fn apply<'a>(&self, line: &'a str) -> Option<Cow<'a, str>> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return None;
        }
        if self.quiet_patterns.iter().any(|p| line.contains(p.as_str())) {
            return None;
        }
        if self.line_limit == 0 || line.chars().count() <= self.line_limit {
            return Some(Cow::Borrowed(line));
        }
        let cut: String = line.chars().take(self.line_limit).collect();
        Some(Cow::Owned(format!("{cut}…")))
    }
}

/// Forward a child stream line by line into the log.
pub fn forward_output<R>(
    service: String,
    stream: R,
    kind: Stream,
    filter: OutputFilter,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(line) = filter.apply(&line) else {
                continue;
            };
            match kind {
                Stream::Stdout => log::info!("[{service}] {line}"),
                Stream::Stderr => log::warn!("[{service}] {line}"),
            }
        }
    })
}
