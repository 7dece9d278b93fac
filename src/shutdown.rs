//! Signal-driven, ordered termination of all services.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::ipc::Evt;
use crate::service::port;

// Cheap, polling‑based Unix signal handling (lock‑free).
static RECEIVED_SIGNAL: AtomicUsize = AtomicUsize::new(0);

pub fn install_signal_handlers() -> anyhow::Result<()> {
    use nix::sys::signal::{self, Signal};
    extern "C" fn handler(sig: i32) {
        RECEIVED_SIGNAL.store(sig as usize, Ordering::SeqCst);
    }
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        let installed = unsafe {
            signal::sigaction(
                sig,
                &signal::SigAction::new(
                    signal::SigHandler::Handler(handler),
                    signal::SaFlags::empty(),
                    signal::SigSet::empty(),
                ),
            )
        };
        installed.map_err(|e| {
            anyhow::anyhow!(
                "Failed to register {sig} handler: {e}. Signal handling is required for orderly shutdown."
            )
        })?;
    }
    Ok(())
}

/// Non‑blocking check – returns Some(signal) once.
pub fn check_signals() -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    let val = RECEIVED_SIGNAL.swap(0, Ordering::AcqRel);
    if val == 0 {
        return None;
    }
    match Signal::try_from(val as i32) {
        Ok(sig) => Some(sig),
        Err(e) => {
            log::error!("BUG: Invalid signal number {val} from signal handler: {e}");
            None
        }
    }
}

/// Requests shutdown without a signal (embedders, tests).
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    bus_tx: Sender<Evt>,
}

impl ShutdownHandle {
    pub(crate) fn new(bus_tx: Sender<Evt>) -> Self {
        Self { bus_tx }
    }

    /// Returns `false` if the supervisor is already gone.
    pub fn request(&self, reason: impl Into<String>) -> bool {
        self.bus_tx
            .send(Evt::Shutdown {
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// Walks services one at a time in shutdown order.
///
/// The coordinator only tracks progress; the manager issues the actual stops
/// and tells it when a service is confirmed dead.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    queue: VecDeque<String>,
    current: Option<String>,
    sweep: Vec<u16>,
    deadline: Instant,
}

impl ShutdownCoordinator {
    pub fn new(order: Vec<String>, sweep: Vec<u16>, budget: Duration) -> Self {
        Self {
            queue: order.into(),
            current: None,
            sweep,
            deadline: Instant::now() + budget,
        }
    }

    /// Service whose stop is being awaited, advancing to the next one if
    /// none is.
    pub fn current_or_next(&mut self) -> Option<&str> {
        if self.current.is_none() {
            self.current = self.queue.pop_front();
        }
        self.current.as_deref()
    }

    pub fn finish_current(&mut self) {
        self.current = None;
    }

    pub fn is_done(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Services never confirmed dead.
    pub fn outstanding(&self) -> Vec<&str> {
        self.current
            .iter()
            .chain(self.queue.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn sweep_ports(&self) -> &[u16] {
        &self.sweep
    }
}

/// Final port cleanup after every service has been stopped.
pub fn sweep_ports(ports: &[u16], release_timeout: Duration) {
    for &port in ports {
        match port::preempt_port(port, release_timeout) {
            Ok(killed) if !killed.is_empty() => {
                log::warn!("Port sweep: killed pid(s) {killed:?} still holding port {port}");
            }
            Ok(_) => log::debug!("Port sweep: {port} is free"),
            Err(e) => log::error!("Port sweep: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_services_one_at_a_time() {
        let mut coord = ShutdownCoordinator::new(
            vec!["web".into(), "api".into(), "node".into()],
            vec![3000, 8282, 8545],
            Duration::from_secs(60),
        );

        assert_eq!(coord.current_or_next(), Some("web"));
        assert_eq!(coord.current_or_next(), Some("web"), "stays until finished");
        coord.finish_current();
        assert_eq!(coord.current_or_next(), Some("api"));
        assert_eq!(coord.outstanding(), ["api", "node"]);
        coord.finish_current();
        assert_eq!(coord.current_or_next(), Some("node"));
        coord.finish_current();
        assert_eq!(coord.current_or_next(), None);
        assert!(coord.is_done());
        assert_eq!(coord.sweep_ports(), [3000, 8282, 8545]);
    }

    #[test]
    fn overdue_after_budget() {
        let coord = ShutdownCoordinator::new(Vec::new(), Vec::new(), Duration::from_secs(5));
        assert!(coord.is_done());
        assert!(!coord.is_overdue(Instant::now()));
        assert!(coord.is_overdue(Instant::now() + Duration::from_secs(6)));
    }

    #[test]
    fn handle_reports_closed_bus() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = ShutdownHandle::new(tx);
        assert!(handle.request("test"));
        assert!(matches!(rx.try_recv(), Ok(Evt::Shutdown { reason }) if reason == "test"));
        drop(rx);
        assert!(!handle.request("again"));
    }
}
