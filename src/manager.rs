use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use log::{debug, error, info, warn};
use tokio::runtime::Handle;

use crate::config::{QuickLink, SupervisorConfig, SupervisorSettings};
use crate::error::{SupervisorError, describe_exit};
use crate::health::{HealthChecker, HealthResult};
use crate::ipc::Evt;
use crate::lifecycle::{InFlight, Lifecycle, RestartPolicy};
use crate::registry::{ServiceRegistry, ServiceSpec};
use crate::service::{ProcessHandle, ProcessLauncher};
use crate::shutdown::{ShutdownCoordinator, ShutdownHandle, check_signals, sweep_ports};
use crate::state_machine::{Action, Event, State};
use crate::status::{ServiceSnapshot, StatusReporter, StatusSnapshot};

/// Global event bus size – small fixed size → zero heap growth.
const BUS_BOUND: usize = 128;
/// Events one service can have queued at once: spawn outcome and exit of
/// its launch task, plus its probe and stale probes of earlier launches.
const EVENTS_PER_SERVICE: usize = 8;
const SIGNAL_POLL: Duration = Duration::from_millis(200);
/// Resolution of pending starts and probe deadlines.
const TIMER_TICK: Duration = Duration::from_millis(100);
/// Allowance per service on top of its stop budget before shutdown gives up
/// waiting.
const STOP_SLACK: Duration = Duration::from_secs(2);

/// Whether the supervisor owns the processes or only watches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Supervise,
    /// Probe and display already running services; never spawn or kill.
    MonitorOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartReason {
    Initial,
    Restart { attempt: u32 },
    SpawnRetry,
}

/// A launch waiting for its deadline.
#[derive(Debug)]
struct PendingStart {
    due: Instant,
    reason: StartReason,
}

/// Everything the control loop knows about one service.
#[derive(Debug)]
struct ServiceRuntime {
    name: String,
    lifecycle: Lifecycle,
    process: Option<ProcessHandle>,
    /// Bumped on every launch; bus events from older launches are stale.
    generation: u64,
    spawns: u32,
    probe_in_flight: bool,
    next_probe_at: Instant,
    last_change: DateTime<Local>,
    last_healthy: Option<DateTime<Local>>,
}

impl ServiceRuntime {
    fn new(spec: &ServiceSpec, settings: &SupervisorSettings) -> Self {
        let policy = RestartPolicy {
            max_restarts: spec.max_restarts,
            failure_threshold: settings.failure_threshold,
            grace_period: spec.grace_period,
            sustained_health: settings.sustained_health(),
        };
        Self {
            name: spec.name.clone(),
            lifecycle: Lifecycle::new(policy),
            process: None,
            generation: 0,
            spawns: 0,
            probe_in_flight: false,
            next_probe_at: Instant::now(),
            last_change: Local::now(),
            last_healthy: None,
        }
    }

    /// Feed the lifecycle and log whatever it changed.
    fn step(&mut self, event: Event) -> Action {
        let before = self.lifecycle.state();
        let attempts = self.lifecycle.attempts();
        let action = self.lifecycle.step(event);
        let after = self.lifecycle.state();

        if before != after {
            self.last_change = Local::now();
            match after {
                State::Crashed => error!("{}: {before} → {after}", self.name),
                State::Unhealthy => warn!("{}: {before} → {after}", self.name),
                _ => info!("{}: {before} → {after}", self.name),
            }
        }
        if attempts > 0 && self.lifecycle.attempts() == 0 {
            info!(
                "{}: healthy for {:?}, restart counter reset",
                self.name,
                self.lifecycle.policy().sustained_health
            );
        }
        action
    }

    /// The bus event belongs to the process we currently hold.
    fn owns(&self, generation: u64) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| p.generation() == generation)
    }

    fn snapshot(&self, spec: &ServiceSpec) -> ServiceSnapshot {
        ServiceSnapshot {
            name: spec.name.clone(),
            display_name: spec.display_name.clone(),
            status: self.lifecycle.state(),
            url: spec.url.clone(),
            pid: self.process.as_ref().and_then(ProcessHandle::pid),
            restarts: self.lifecycle.attempts(),
            max_restarts: spec.max_restarts,
            spawns: self.spawns,
            last_change: self.last_change,
            last_healthy: self.last_healthy,
        }
    }
}

/// Top‑level manager supervising *all* services from one control loop.
///
/// Process I/O and probes run as Tokio tasks; their outcomes come back as
/// [`Evt`]s on the bus, and only this loop mutates service state.
pub struct ServiceManager {
    registry: ServiceRegistry,
    settings: SupervisorSettings,
    links: Vec<QuickLink>,
    runtime: Handle,
    launcher: ProcessLauncher,
    checker: HealthChecker,
    reporter: StatusReporter,
    bus_tx: Sender<Evt>,
    bus_rx: Receiver<Evt>,
    services: HashMap<String, ServiceRuntime>,
    pending_starts: HashMap<String, PendingStart>,
    mode: RunMode,
    shutting_down: bool,
    shutdown: Option<ShutdownCoordinator>,
    swept_ports: Vec<u16>,
    started_at: Instant,
}

impl ServiceManager {
    /// Validate the catalog and prepare one runtime slot per service.
    /// Nothing is spawned until [`run`](Self::run).
    pub fn new(cfg: &SupervisorConfig, runtime: Handle, mode: RunMode) -> Result<Self> {
        let registry = ServiceRegistry::from_definitions(&cfg.services)?;
        let settings = cfg.supervisor.clone();
        let (bus_tx, bus_rx) = bounded::<Evt>(bus_capacity(registry.len()));

        let services = registry
            .iter()
            .map(|spec| (spec.name.clone(), ServiceRuntime::new(spec, &settings)))
            .collect();

        Ok(Self {
            launcher: ProcessLauncher::new(runtime.clone(), bus_tx.clone(), &settings),
            checker: HealthChecker::new(settings.probe_timeout())?,
            reporter: StatusReporter::new(settings.dashboard),
            links: cfg.links.clone(),
            registry,
            settings,
            runtime,
            bus_tx,
            bus_rx,
            services,
            pending_starts: HashMap::new(),
            mode,
            shutting_down: false,
            shutdown: None,
            swept_ports: Vec::new(),
            started_at: Instant::now(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.bus_tx.clone())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let services = self
            .registry
            .iter()
            .filter_map(|spec| self.services.get(&spec.name).map(|rt| rt.snapshot(spec)))
            .collect();
        StatusSnapshot {
            uptime: self.started_at.elapsed(),
            services,
            links: self.links.clone(),
            monitor_only: self.mode == RunMode::MonitorOnly,
            shutting_down: self.shutting_down,
            swept_ports: self.swept_ports.clone(),
        }
    }

    /// Central event‑loop. Runs until SIGINT / SIGTERM or a
    /// [`ShutdownHandle`] request, then returns the final state.
    ///
    /// Blocks the calling thread; call it outside the Tokio runtime whose
    /// handle was passed to [`new`](Self::new).
    pub fn run(mut self) -> Result<StatusSnapshot> {
        self.started_at = Instant::now();
        match self.mode {
            RunMode::Supervise => {
                info!(
                    "Supervising {} service(s), startup stagger {:?}",
                    self.registry.len(),
                    self.settings.startup_stagger()
                );
                let stagger = self.settings.startup_stagger();
                let now = Instant::now();
                for (i, spec) in self.registry.iter().enumerate() {
                    self.pending_starts.insert(
                        spec.name.clone(),
                        PendingStart {
                            due: now + stagger * i as u32,
                            reason: StartReason::Initial,
                        },
                    );
                }
            }
            RunMode::MonitorOnly => {
                info!(
                    "Monitor-only mode: probing {} service(s), nothing will be spawned or stopped",
                    self.registry.len()
                );
            }
        }
        self.process_pending_starts();
        self.report_status();

        let sig_tick = tick(SIGNAL_POLL);
        let timer_tick = tick(TIMER_TICK);
        let status_tick = tick(self.settings.status_interval());

        loop {
            select! {
                recv(self.bus_rx) -> evt => self.handle_event(evt?),
                recv(sig_tick) -> _ => {
                    if let Some(sig) = check_signals() { // coarse polling ≈200 ms
                        info!("signal {sig:?} – orderly shutdown");
                        self.begin_shutdown(&format!("signal {sig}"));
                    }
                }
                recv(timer_tick) -> _ => {
                    self.process_pending_starts();
                    self.dispatch_probes();
                }
                recv(status_tick) -> _ => self.report_status(),
            }

            if self.shutdown_finished() {
                break;
            }
        }

        if let Some(coord) = self.shutdown.take()
            && !coord.sweep_ports().is_empty()
        {
            info!("Sweeping ports {:?}", coord.sweep_ports());
            sweep_ports(coord.sweep_ports(), self.settings.port_release_timeout());
            self.swept_ports = coord.sweep_ports().to_vec();
        }

        let snapshot = self.snapshot();
        self.report_status();
        info!(
            "Supervisor stopped after {}",
            crate::status::format_uptime(snapshot.uptime)
        );
        Ok(snapshot)
    }

    fn handle_event(&mut self, evt: Evt) {
        match evt {
            Evt::Spawned {
                service,
                generation,
                pid,
                ts,
            } => {
                let Some(rt) = self.services.get_mut(&service) else {
                    return;
                };
                if !rt.owns(generation) {
                    debug!("{service}: stale spawn of generation {generation} ignored");
                    return;
                }
                info!("{service} spawned (pid {pid}) at {ts}");
                if let Some(process) = rt.process.as_mut() {
                    process.set_pid(pid);
                }
                rt.spawns += 1;
                rt.next_probe_at = Instant::now() + self.settings.startup_probe_interval();
                rt.step(Event::Spawned { at: Instant::now() });

                if self.shutting_down {
                    self.advance_shutdown();
                }
            }

            Evt::SpawnFailed {
                service,
                generation,
                error: err,
            } => {
                let Some(rt) = self.services.get_mut(&service) else {
                    return;
                };
                if !rt.owns(generation) {
                    return;
                }
                error!("{err}");
                rt.process = None;
                let action = rt.step(Event::SpawnFailed);
                self.apply(&service, action);

                if self.shutting_down {
                    self.advance_shutdown();
                }
            }

            Evt::Exited {
                service,
                generation,
                code,
                forced,
                ts,
            } => {
                let Some(rt) = self.services.get_mut(&service) else {
                    return;
                };
                if !rt.owns(generation) {
                    debug!("{service}: stale exit of generation {generation} ignored");
                    return;
                }
                rt.process = None;
                rt.probe_in_flight = false;

                let how = if forced { "killed" } else { "exited" };
                if self.shutting_down {
                    info!("{service} {how} during shutdown ({}) at {ts}", describe_exit(&code));
                }
                let action = rt.step(Event::Exited { code });
                if matches!(action, Action::ScheduleRestart { .. } | Action::GiveUp) {
                    warn!(
                        "{}",
                        SupervisorError::UnexpectedExit {
                            service: service.clone(),
                            code,
                        }
                    );
                } else if !self.shutting_down {
                    info!("{service} {how} ({}) at {ts}", describe_exit(&code));
                }
                self.apply(&service, action);

                if self.shutting_down {
                    self.advance_shutdown();
                }
            }

            Evt::Health {
                service,
                generation,
                result,
            } => self.handle_health(&service, generation, result),

            Evt::Shutdown { reason } => self.begin_shutdown(&reason),
        }
    }

    fn handle_health(&mut self, service: &str, generation: u64, result: HealthResult) {
        let monitor_only = self.mode == RunMode::MonitorOnly;
        let Some(rt) = self.services.get_mut(service) else {
            return;
        };
        if rt.generation != generation {
            return;
        }
        rt.probe_in_flight = false;
        // the process it was aimed at is gone
        if self.shutting_down || (!monitor_only && rt.process.is_none()) {
            return;
        }

        let now = Instant::now();
        let in_grace = rt.lifecycle.in_grace(now);
        let event = match &result {
            HealthResult::Healthy { status } => {
                debug!("{service}: probe ok ({status})");
                rt.last_healthy = Some(Local::now());
                Event::ProbePassed { at: now }
            }
            HealthResult::Unhealthy(reason) if in_grace => {
                debug!("{reason} (within grace period)");
                Event::ProbeFailed { at: now }
            }
            HealthResult::Unhealthy(reason) => {
                warn!("{reason}");
                Event::ProbeFailed { at: now }
            }
        };
        let action = rt.step(event);

        let startup = !monitor_only && (in_grace || rt.lifecycle.state() == State::Starting);
        rt.next_probe_at = now
            + if startup {
                self.settings.startup_probe_interval()
            } else {
                self.settings.probe_interval()
            };

        self.apply(service, action);
    }

    /// Carry out what a lifecycle decided.
    fn apply(&mut self, service: &str, action: Action) {
        let now = Instant::now();
        match action {
            Action::Nothing => {}
            Action::SpawnProcess => {
                // only issued from `launch`
                debug!("{service}: unexpected spawn request ignored");
            }
            Action::RetrySpawn => {
                if self.shutting_down {
                    return;
                }
                let delay = self.settings.spawn_retry_delay();
                warn!("{service}: spawn failed, retrying once in {delay:?}");
                self.pending_starts.insert(
                    service.to_string(),
                    PendingStart {
                        due: now + delay,
                        reason: StartReason::SpawnRetry,
                    },
                );
            }
            Action::StopProcess => {
                warn!(
                    "{service}: {} consecutive failed probes, stopping for restart",
                    self.settings.failure_threshold
                );
                if let Some(process) = self
                    .services
                    .get_mut(service)
                    .and_then(|rt| rt.process.as_mut())
                {
                    process.stop();
                }
            }
            Action::ScheduleRestart { attempt } => {
                if self.shutting_down {
                    return;
                }
                let delay = self.settings.restart_delay();
                let max = self.registry.get(service).map_or(0, |s| s.max_restarts);
                info!("Scheduled restart for {service} in {delay:?} (attempt #{attempt}/{max})");
                self.pending_starts.insert(
                    service.to_string(),
                    PendingStart {
                        due: now + delay,
                        reason: StartReason::Restart { attempt },
                    },
                );
            }
            Action::GiveUp => {
                let max_restarts = self.registry.get(service).map_or(0, |s| s.max_restarts);
                error!(
                    "{}",
                    SupervisorError::RestartBudgetExhausted {
                        service: service.to_string(),
                        max_restarts,
                    }
                );
            }
        }
    }

    /// Launch every pending start whose deadline has passed.
    fn process_pending_starts(&mut self) {
        if self.shutting_down || self.pending_starts.is_empty() {
            return;
        }
        let now = Instant::now();
        let due: Vec<String> = self
            .pending_starts
            .iter()
            .filter(|(_, pending)| now >= pending.due)
            .map(|(service, _)| service.clone())
            .collect();

        for service in due {
            if let Some(pending) = self.pending_starts.remove(&service) {
                self.launch(&service, pending.reason);
            }
        }
    }

    fn launch(&mut self, service: &str, reason: StartReason) {
        let (Some(spec), Some(rt)) = (self.registry.get(service), self.services.get_mut(service))
        else {
            return;
        };
        if rt.process.is_some() {
            error!("BUG: {service} already has a live process, launch skipped");
            return;
        }
        match rt.step(Event::CmdStart) {
            Action::SpawnProcess => {
                match reason {
                    StartReason::Initial => info!("Starting {service}"),
                    StartReason::Restart { attempt } => {
                        info!("Restarting {service} (attempt #{attempt})")
                    }
                    StartReason::SpawnRetry => info!("Retrying spawn of {service}"),
                }
                rt.generation += 1;
                rt.probe_in_flight = false;
                rt.process = Some(self.launcher.start(spec, rt.generation));
            }
            _ => debug!("{service}: start skipped in state {}", rt.lifecycle.state()),
        }
    }

    /// Fire every due probe, at most one outstanding per service.
    fn dispatch_probes(&mut self) {
        if self.shutting_down {
            return;
        }
        let monitor_only = self.mode == RunMode::MonitorOnly;
        let now = Instant::now();

        for spec in self.registry.iter() {
            let Some(rt) = self.services.get_mut(&spec.name) else {
                continue;
            };
            let eligible = monitor_only
                || (rt.process.is_some() && rt.lifecycle.is_running() && rt.lifecycle.is_idle());
            if !eligible || rt.probe_in_flight || now < rt.next_probe_at {
                continue;
            }
            rt.probe_in_flight = true;

            let checker = self.checker.clone();
            let spec = spec.clone();
            let bus_tx = self.bus_tx.clone();
            let generation = rt.generation;
            self.runtime.spawn(async move {
                let result = checker.check(&spec).await;
                let _ = bus_tx.send(Evt::Health {
                    service: spec.name,
                    generation,
                    result,
                });
            });
        }
    }

    fn begin_shutdown(&mut self, reason: &str) {
        if self.shutting_down {
            info!("Shutdown already in progress, ignoring {reason}");
            return;
        }
        // set before anything else so no exit handled from here on restarts
        self.shutting_down = true;
        info!("Shutting down ({reason})");

        if !self.pending_starts.is_empty() {
            info!("Cancelled {} pending start(s)", self.pending_starts.len());
            self.pending_starts.clear();
        }

        let mut sweep = Vec::new();
        for spec in self.registry.iter() {
            if let Some(rt) = self.services.get_mut(&spec.name) {
                rt.step(Event::Shutdown);
                // already confirmed dead services keep their port untouched
                if rt.process.is_some() {
                    sweep.push(spec.port);
                }
            }
        }

        let order: Vec<String> = self
            .registry
            .shutdown_order(self.settings.shutdown_order)
            .into_iter()
            .map(|spec| spec.name.clone())
            .collect();
        let budget = (self.launcher.stop_budget() + STOP_SLACK) * order.len().max(1) as u32
            + self.settings.port_release_timeout();
        self.shutdown = Some(ShutdownCoordinator::new(order, sweep, budget));

        self.report_status();
        self.advance_shutdown();
    }

    /// Stop services one at a time; each must be confirmed dead before the
    /// next is asked.
    fn advance_shutdown(&mut self) {
        let Some(coord) = self.shutdown.as_mut() else {
            return;
        };
        while let Some(service) = coord.current_or_next().map(str::to_owned) {
            let Some(rt) = self.services.get_mut(&service) else {
                coord.finish_current();
                continue;
            };
            let Some(process) = rt.process.as_mut() else {
                debug!("{service}: not running");
                coord.finish_current();
                continue;
            };
            if rt.lifecycle.begin_stop() {
                if process.stop() {
                    info!("Stopping {service}");
                }
            } else if rt.lifecycle.in_flight() == Some(InFlight::Start) {
                // shutdown is the one stop allowed during a start: the launch
                // task sees it before spawning or right after
                if process.stop() {
                    info!("Cancelling start of {service}");
                }
            } else {
                debug!("{service}: health-triggered stop already under way");
            }
            // resumed by its Exited event
            return;
        }
    }

    fn shutdown_finished(&self) -> bool {
        let Some(coord) = &self.shutdown else {
            return false;
        };
        if coord.is_done() {
            info!("All services stopped");
            return true;
        }
        if coord.is_overdue(Instant::now()) {
            error!(
                "Shutdown deadline passed, still waiting on {:?}; continuing with port sweep",
                coord.outstanding()
            );
            return true;
        }
        false
    }

    fn report_status(&self) {
        if let Err(e) = self.reporter.report(&self.snapshot()) {
            warn!("Failed to render status: {e}");
        }
    }
}

/// Bus size for `services` services.
///
/// Senders are Tokio tasks using the blocking `send`, so the bus must hold
/// everything the services can have outstanding at once; a full bus would
/// park a runtime worker until the loop drains it.
fn bus_capacity(services: usize) -> usize {
    BUS_BOUND.max(services * EVENTS_PER_SERVICE)
}

/// One-shot probe of every configured service, without spawning anything.
pub async fn check_once(cfg: &SupervisorConfig) -> Result<StatusSnapshot> {
    let registry = ServiceRegistry::from_definitions(&cfg.services)?;
    let checker = HealthChecker::new(cfg.supervisor.probe_timeout())?;
    let started = Instant::now();

    let probes: Vec<_> = registry
        .iter()
        .map(|spec| {
            let checker = checker.clone();
            let spec = spec.clone();
            tokio::spawn(async move {
                let result = checker.check(&spec).await;
                (spec, result)
            })
        })
        .collect();

    let mut services = Vec::with_capacity(probes.len());
    for probe in probes {
        let (spec, result) = probe.await?;
        let status = match result {
            HealthResult::Healthy { .. } => State::Healthy,
            HealthResult::Unhealthy(reason) => {
                warn!("{reason}");
                State::Unhealthy
            }
        };
        services.push(ServiceSnapshot {
            name: spec.name,
            display_name: spec.display_name,
            status,
            url: spec.url,
            pid: None,
            restarts: 0,
            max_restarts: spec.max_restarts,
            spawns: 0,
            last_change: Local::now(),
            last_healthy: (status == State::Healthy).then(Local::now),
        });
    }

    Ok(StatusSnapshot {
        uptime: started.elapsed(),
        services,
        links: cfg.links.clone(),
        monitor_only: true,
        shutting_down: false,
        swept_ports: Vec::new(),
    })
}
