//! ProcessLauncher: spawns service processes and owns their handles.
//!
//! Each launch runs as one Tokio task that preempts the service port, spawns
//! the child, forwards its output and then waits for either the child to
//! exit or a stop request. Every outcome is reported on the supervisor bus.

pub mod port;
pub mod process;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::SupervisorSettings;
use crate::error::SupervisorError;
use crate::ipc::Evt;
use crate::registry::ServiceSpec;
use process::{OutputFilter, Stream, forward_output, terminate_gracefully};

/// How long output forwarders may keep draining after the child is gone.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// The one live process of a service.
#[derive(Debug)]
pub struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn set_pid(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    /// Ask the launch task to terminate the child. Returns `false` if a stop
    /// was already requested.
    pub fn stop(&mut self) -> bool {
        match self.stop_tx.take() {
            Some(tx) => {
                // receiver gone means the task already finished
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    runtime: Handle,
    bus_tx: Sender<Evt>,
    stop_grace: Duration,
    kill_timeout: Duration,
    port_release_timeout: Duration,
    output_line_limit: usize,
}

impl ProcessLauncher {
    pub fn new(runtime: Handle, bus_tx: Sender<Evt>, settings: &SupervisorSettings) -> Self {
        Self {
            runtime,
            bus_tx,
            stop_grace: settings.stop_grace(),
            kill_timeout: settings.kill_timeout(),
            port_release_timeout: settings.port_release_timeout(),
            output_line_limit: settings.output_line_limit,
        }
    }

    /// Upper bound on how long a single stop can take.
    pub fn stop_budget(&self) -> Duration {
        self.stop_grace + self.kill_timeout
    }

    /// Launch `spec` as generation `generation`. The returned handle is the
    /// only way to stop the process.
    pub fn start(&self, spec: &ServiceSpec, generation: u64) -> ProcessHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        // detached: the task reports its own end on the bus
        self.runtime.spawn(run_service(
            spec.clone(),
            generation,
            self.clone(),
            stop_rx,
        ));

        ProcessHandle {
            generation,
            pid: None,
            stop_tx: Some(stop_tx),
        }
    }

    fn emit(&self, evt: Evt) {
        if let Err(e) = self.bus_tx.send(evt) {
            log::debug!("Supervisor bus closed, dropping {:?}", e.into_inner());
        }
    }
}

fn build_command(spec: &ServiceSpec) -> tokio::process::Command {
    // Resolve bare program names using which crate
    let program = if spec.command.contains(std::path::MAIN_SEPARATOR) {
        PathBuf::from(&spec.command)
    } else {
        which::which(&spec.command).unwrap_or_else(|_| {
            log::warn!("{} not found in PATH, using it verbatim", spec.command);
            PathBuf::from(&spec.command)
        })
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // own group so SIGTERM reaches grandchildren (npm → node)
        .process_group(0)
        .kill_on_drop(true);
    cmd
}

async fn run_service(
    spec: ServiceSpec,
    generation: u64,
    launcher: ProcessLauncher,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let name = spec.name.clone();

    let port = spec.port;
    let release_timeout = launcher.port_release_timeout;
    match tokio::task::spawn_blocking(move || port::preempt_port(port, release_timeout)).await {
        Ok(Ok(killed)) if !killed.is_empty() => {
            log::warn!("{name}: preempted port {port} from pid(s) {killed:?}");
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => log::error!("{name}: {e}"),
        Err(e) => log::error!("{name}: port preemption task failed: {e}"),
    }

    // stop arrived while the port was being cleared
    if !matches!(stop_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
        log::info!("{name}: stop requested before spawn, not launching");
        launcher.emit(Evt::Exited {
            service: name,
            generation,
            code: None,
            forced: false,
            ts: chrono::Utc::now(),
        });
        return;
    }

    log::info!(
        "{name}: spawning `{} {}` in {}",
        spec.command,
        spec.args.join(" "),
        spec.working_dir.display()
    );

    let mut child = match build_command(&spec).spawn() {
        Ok(child) => child,
        Err(source) => {
            launcher.emit(Evt::SpawnFailed {
                service: name.clone(),
                generation,
                error: SupervisorError::SpawnFailure {
                    service: name,
                    command: spec.command.clone(),
                    source,
                },
            });
            return;
        }
    };

    let pid = child.id().unwrap_or_default();
    launcher.emit(Evt::Spawned {
        service: name.clone(),
        generation,
        pid,
        ts: chrono::Utc::now(),
    });

    let filter = OutputFilter::new(spec.quiet_patterns.clone(), launcher.output_line_limit);
    let mut forwarders = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(forward_output(name.clone(), stdout, Stream::Stdout, filter.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(forward_output(name.clone(), stderr, Stream::Stderr, filter));
    }

    let (code, forced) = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => (status.code(), false),
            Err(e) => {
                log::error!("{name} status check error: {e}");
                (None, false)
            }
        },
        _ = &mut stop_rx => {
            let outcome = terminate_gracefully(
                &name,
                &mut child,
                launcher.stop_grace,
                launcher.kill_timeout,
            )
            .await;
            (outcome.code, outcome.forced)
        }
    };

    // let trailing output through; grandchildren may keep the pipes open
    for mut task in forwarders {
        if tokio::time::timeout(OUTPUT_DRAIN, &mut task).await.is_err() {
            task.abort();
        }
    }

    launcher.emit(Evt::Exited {
        service: name,
        generation,
        code,
        forced,
        ts: chrono::Utc::now(),
    });
}
