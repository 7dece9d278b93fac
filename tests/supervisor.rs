//! Drives the real control loop with `/bin/sh` children and millisecond
//! timings.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use stackmond::config::SupervisorConfig;
use stackmond::manager::{RunMode, ServiceManager};
use stackmond::state_machine::State;
use stackmond::status::StatusSnapshot;
use tempfile::TempDir;

/// Runs until SIGTERM, then exits 0.
const COOPERATIVE: &str = "trap 'exit 0' TERM; while :; do sleep 0.05; done";

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Single `svc` service running `script`, working directory kept alive by
/// the returned guard.
fn config(script: &str, port: u16, restart_delay_ms: u64) -> (SupervisorConfig, TempDir) {
    config_with(
        script,
        port,
        &format!("restart_delay_ms = {restart_delay_ms}\nstartup_probe_interval_ms = 60000"),
        "max_restarts = 3",
    )
}

/// Like [`config`], with extra `[supervisor]` and service keys.
fn config_with(
    script: &str,
    port: u16,
    settings: &str,
    service: &str,
) -> (SupervisorConfig, TempDir) {
    let workdir = tempfile::tempdir().unwrap();
    let mut cfg = SupervisorConfig::parse(&format!(
        r#"
        [supervisor]
        spawn_retry_delay_ms = 50
        startup_stagger_ms = 0
        stop_grace_ms = 2000
        kill_timeout_ms = 1000
        port_release_timeout_ms = 500
        status_interval_ms = 200
        dashboard = false
        {settings}

        [[services]]
        name = "svc"
        command = "/bin/sh"
        args = ["-c", "{script}"]
        port = {port}
        {service}
        "#
    ))
    .unwrap();
    cfg.anchor_to(workdir.path());
    (cfg, workdir)
}

/// Answer every HTTP request on `listener` with 200.
fn serve_ok(listener: TcpListener) {
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
            );
        }
    });
}

/// Run `cfg` until a shutdown is requested after `stop_after`.
fn run_for(
    cfg: &SupervisorConfig,
    mode: RunMode,
    stop_after: Duration,
) -> (StatusSnapshot, Duration) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mgr = ServiceManager::new(cfg, rt.handle().clone(), mode).unwrap();
    let handle = mgr.shutdown_handle();

    let requester = thread::spawn(move || {
        thread::sleep(stop_after);
        handle.request("test finished");
    });

    let started = Instant::now();
    let snapshot = mgr.run().unwrap();
    let elapsed = started.elapsed();
    requester.join().unwrap();
    (snapshot, elapsed)
}

#[test]
fn crash_looping_service_exhausts_its_budget() {
    let (cfg, _workdir) = config("exit 3", free_port(), 100);
    let (snapshot, _) = run_for(&cfg, RunMode::Supervise, Duration::from_secs(2));

    let svc = snapshot.service("svc").unwrap();
    assert_eq!(svc.status, State::Crashed);
    assert_eq!(svc.spawns, 4, "initial launch plus three restarts");
    assert_eq!(svc.restarts, 3);
    assert_eq!(svc.pid, None);
}

#[test]
fn shutdown_cancels_a_pending_restart() {
    let (cfg, _workdir) = config("sleep 0.2; exit 1", free_port(), 1_000);
    let (snapshot, _) = run_for(&cfg, RunMode::Supervise, Duration::from_millis(600));

    let svc = snapshot.service("svc").unwrap();
    assert_eq!(svc.spawns, 1, "restart scheduled for after shutdown must not run");
    assert_eq!(svc.status, State::Stopped);
    assert!(snapshot.shutting_down);
    assert!(
        snapshot.swept_ports.is_empty(),
        "already dead service must be left out of the sweep"
    );
}

#[test]
fn long_running_service_is_stopped_on_shutdown() {
    let port = free_port();
    let (cfg, _workdir) = config(COOPERATIVE, port, 100);
    let (snapshot, elapsed) = run_for(&cfg, RunMode::Supervise, Duration::from_millis(500));

    let svc = snapshot.service("svc").unwrap();
    assert_eq!(svc.spawns, 1);
    assert_eq!(svc.status, State::Stopped);
    assert_eq!(svc.pid, None);
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
    assert_eq!(snapshot.swept_ports, vec![port]);
}

#[test]
fn monitor_only_probes_without_spawning() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_ok(listener);

    let (cfg, _workdir) = config("exit 0", port, 100);
    let (snapshot, _) = run_for(&cfg, RunMode::MonitorOnly, Duration::from_millis(800));

    let svc = snapshot.service("svc").unwrap();
    assert_eq!(svc.status, State::Healthy);
    assert_eq!(svc.spawns, 0);
    assert!(snapshot.monitor_only);
    assert!(snapshot.swept_ports.is_empty());
}

#[test]
fn answering_service_turns_healthy_within_grace() {
    // the service's port answers from this process
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_ok(listener);

    let (cfg, _workdir) = config_with(
        COOPERATIVE,
        port,
        "startup_probe_interval_ms = 100\nprobe_interval_ms = 100",
        "grace_period_ms = 5000",
    );
    let (snapshot, _) = run_for(&cfg, RunMode::Supervise, Duration::from_millis(1_500));

    let svc = snapshot.service("svc").unwrap();
    assert!(svc.last_healthy.is_some(), "never probed healthy");
    assert_eq!(svc.spawns, 1);
    assert_eq!(svc.restarts, 0);
}

#[test]
fn persistently_unhealthy_service_is_restarted_until_crashed() {
    let (cfg, _workdir) = config_with(
        COOPERATIVE,
        free_port(),
        "restart_delay_ms = 100\n\
         startup_probe_interval_ms = 100\n\
         probe_interval_ms = 100\n\
         probe_timeout_ms = 300\n\
         failure_threshold = 2",
        "max_restarts = 2\ngrace_period_ms = 200",
    );
    let (snapshot, _) = run_for(&cfg, RunMode::Supervise, Duration::from_secs(5));

    let svc = snapshot.service("svc").unwrap();
    assert_eq!(svc.status, State::Crashed);
    assert_eq!(svc.spawns, 3, "initial launch plus two health-triggered restarts");
    assert_eq!(svc.restarts, 2);
    assert!(svc.last_healthy.is_none());
}
