//! Per-service restart policy.
//!
//! `Lifecycle` is a pure state machine: it never touches processes or the
//! clock, it only consumes [`Event`]s and answers with the [`Action`] the
//! manager must carry out. That keeps the restart-budget and grace-window
//! rules testable without spawning anything.

use std::time::{Duration, Instant};

use crate::state_machine::{Action, Event, State};

/// Knobs that decide when a service is relaunched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    /// Consecutive failing probes (outside grace) before the process is
    /// stopped and counted as a crash.
    pub failure_threshold: u32,
    pub grace_period: Duration,
    /// Continuous health required before the restart counter resets.
    pub sustained_health: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            failure_threshold: 3,
            grace_period: Duration::from_secs(5),
            sustained_health: Duration::from_secs(60),
        }
    }
}

/// Operation currently pending for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlight {
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    policy: RestartPolicy,
    state: State,
    attempts: u32,
    consecutive_failures: u32,
    started_at: Option<Instant>,
    healthy_since: Option<Instant>,
    in_flight: Option<InFlight>,
    spawn_retried: bool,
    shutting_down: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(RestartPolicy::default())
    }
}

impl Lifecycle {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            state: State::Stopped,
            attempts: 0,
            consecutive_failures: 0,
            started_at: None,
            healthy_since: None,
            in_flight: None,
            spawn_retried: false,
            shutting_down: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Restart attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    /// No start or stop is pending.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// A process we launched is believed to be alive.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn in_grace(&self, now: Instant) -> bool {
        self.started_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.policy.grace_period)
    }

    /// Claim the service for a stop issued from outside the policy
    /// (shutdown). Returns `false` when another operation is pending or
    /// nothing is running.
    pub fn begin_stop(&mut self) -> bool {
        if !self.is_idle() || !self.is_running() {
            return false;
        }
        self.in_flight = Some(InFlight::Stop);
        true
    }

    pub fn step(&mut self, event: Event) -> Action {
        match event {
            Event::CmdStart => {
                if self.shutting_down
                    || self.state == State::Crashed
                    || !self.is_idle()
                    || self.is_running()
                {
                    return Action::Nothing;
                }
                self.in_flight = Some(InFlight::Start);
                self.state = State::Starting;
                self.consecutive_failures = 0;
                self.healthy_since = None;
                Action::SpawnProcess
            }

            Event::Spawned { at } => {
                if self.in_flight == Some(InFlight::Start) {
                    self.in_flight = None;
                }
                // the free retry covers consecutive spawn failures only
                self.spawn_retried = false;
                self.started_at = Some(at);
                Action::Nothing
            }

            Event::SpawnFailed => {
                self.in_flight = None;
                self.started_at = None;
                if self.shutting_down {
                    self.state = State::Stopped;
                    return Action::Nothing;
                }
                if !self.spawn_retried {
                    self.spawn_retried = true;
                    return Action::RetrySpawn;
                }
                self.spawn_retried = false;
                self.on_failure()
            }

            Event::ProbePassed { at } => {
                if self.in_flight == Some(InFlight::Stop) {
                    return Action::Nothing;
                }
                self.consecutive_failures = 0;
                match self.state {
                    State::Crashed => {}
                    State::Healthy => {
                        let sustained = self.healthy_since.is_some_and(|since| {
                            at.saturating_duration_since(since) >= self.policy.sustained_health
                        });
                        if sustained && self.attempts > 0 {
                            self.attempts = 0;
                        }
                    }
                    State::Stopped | State::Starting | State::Unhealthy => {
                        self.state = State::Healthy;
                        self.healthy_since = Some(at);
                    }
                }
                Action::Nothing
            }

            Event::ProbeFailed { at } => {
                if self.state == State::Crashed || !self.is_idle() {
                    return Action::Nothing;
                }
                // observed but not counted
                if self.in_grace(at) {
                    return Action::Nothing;
                }
                self.healthy_since = None;
                self.consecutive_failures += 1;
                self.state = State::Unhealthy;

                if self.is_running()
                    && !self.shutting_down
                    && self.consecutive_failures >= self.policy.failure_threshold.max(1)
                {
                    self.in_flight = Some(InFlight::Stop);
                    return Action::StopProcess;
                }
                Action::Nothing
            }

            Event::Exited { code } => {
                let requested = self.in_flight == Some(InFlight::Stop);
                self.in_flight = None;
                self.started_at = None;
                self.healthy_since = None;
                self.consecutive_failures = 0;

                if self.state == State::Crashed {
                    return Action::Nothing;
                }
                if self.shutting_down {
                    self.state = State::Stopped;
                    return Action::Nothing;
                }
                if !requested && code == Some(0) {
                    self.state = State::Stopped;
                    return Action::Nothing;
                }
                self.on_failure()
            }

            Event::Shutdown => {
                self.shutting_down = true;
                Action::Nothing
            }
        }
    }

    fn on_failure(&mut self) -> Action {
        if self.attempts < self.policy.max_restarts {
            self.attempts += 1;
            self.state = State::Stopped;
            Action::ScheduleRestart {
                attempt: self.attempts,
            }
        } else {
            self.state = State::Crashed;
            Action::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            failure_threshold: 3,
            grace_period: Duration::from_secs(10),
            sustained_health: Duration::from_secs(60),
        }
    }

    fn launch(lc: &mut Lifecycle, at: Instant) {
        assert_eq!(lc.step(Event::CmdStart), Action::SpawnProcess);
        assert_eq!(lc.step(Event::Spawned { at }), Action::Nothing);
    }

    #[test]
    fn crash_loop_exhausts_budget_after_exactly_max_restarts() {
        let mut lc = Lifecycle::new(policy(3));
        let t0 = Instant::now();
        let mut restarts = 0;

        for _ in 0..4 {
            launch(&mut lc, t0);
            match lc.step(Event::Exited { code: Some(1) }) {
                Action::ScheduleRestart { attempt } => {
                    restarts += 1;
                    assert_eq!(attempt, restarts);
                }
                Action::GiveUp => break,
                other => panic!("unexpected action {other:?}"),
            }
        }

        assert_eq!(restarts, 3);
        assert_eq!(lc.state(), State::Crashed);
        assert_eq!(lc.attempts(), 3);
        assert!(!lc.is_running());

        // terminal: no more spawns, exits ignored
        assert_eq!(lc.step(Event::CmdStart), Action::Nothing);
        assert_eq!(lc.step(Event::Exited { code: Some(1) }), Action::Nothing);
        assert_eq!(lc.state(), State::Crashed);
    }

    #[test]
    fn failing_probes_during_grace_never_count() {
        let mut lc = Lifecycle::new(policy(3));
        let t0 = Instant::now();
        launch(&mut lc, t0);

        for secs in 0..10 {
            let at = t0 + Duration::from_millis(secs * 999);
            assert_eq!(lc.step(Event::ProbeFailed { at }), Action::Nothing);
        }
        assert_eq!(lc.state(), State::Starting);
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn passing_probe_marks_healthy() {
        let mut lc = Lifecycle::new(policy(3));
        let t0 = Instant::now();
        launch(&mut lc, t0);

        lc.step(Event::ProbePassed {
            at: t0 + Duration::from_secs(2),
        });
        assert_eq!(lc.state(), State::Healthy);
    }

    #[test]
    fn persistent_probe_failure_stops_process_and_consumes_budget() {
        let mut lc = Lifecycle::new(policy(3));
        let t0 = Instant::now();
        launch(&mut lc, t0);
        lc.step(Event::ProbePassed {
            at: t0 + Duration::from_secs(1),
        });

        let after_grace = t0 + Duration::from_secs(30);
        assert_eq!(lc.step(Event::ProbeFailed { at: after_grace }), Action::Nothing);
        assert_eq!(lc.state(), State::Unhealthy);
        assert_eq!(lc.step(Event::ProbeFailed { at: after_grace }), Action::Nothing);
        assert_eq!(
            lc.step(Event::ProbeFailed { at: after_grace }),
            Action::StopProcess
        );
        assert_eq!(lc.in_flight(), Some(InFlight::Stop));

        // stop in flight: further probes are ignored
        assert_eq!(lc.step(Event::ProbeFailed { at: after_grace }), Action::Nothing);

        // a requested stop ending in code 0 still counts as a failure
        assert_eq!(
            lc.step(Event::Exited { code: Some(0) }),
            Action::ScheduleRestart { attempt: 1 }
        );
    }

    #[test]
    fn recovery_between_failures_resets_the_streak() {
        let mut lc = Lifecycle::new(policy(3));
        let t0 = Instant::now();
        launch(&mut lc, t0);
        let at = t0 + Duration::from_secs(30);

        lc.step(Event::ProbeFailed { at });
        lc.step(Event::ProbeFailed { at });
        lc.step(Event::ProbePassed { at });
        assert_eq!(lc.state(), State::Healthy);
        assert_eq!(lc.step(Event::ProbeFailed { at }), Action::Nothing);
        assert_eq!(lc.step(Event::ProbeFailed { at }), Action::Nothing);
    }

    #[test]
    fn counter_resets_only_after_sustained_health() {
        let mut lc = Lifecycle::new(policy(3));
        let t0 = Instant::now();

        launch(&mut lc, t0);
        lc.step(Event::Exited { code: Some(1) });
        launch(&mut lc, t0);
        assert_eq!(lc.attempts(), 1);

        let healthy_at = t0 + Duration::from_secs(5);
        lc.step(Event::ProbePassed { at: healthy_at });
        lc.step(Event::ProbePassed {
            at: healthy_at + Duration::from_secs(30),
        });
        assert_eq!(lc.attempts(), 1, "a single short healthy spell must not reset");

        lc.step(Event::ProbePassed {
            at: healthy_at + Duration::from_secs(60),
        });
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn shutdown_suppresses_restart_of_crashing_service() {
        let mut lc = Lifecycle::new(policy(3));
        let t0 = Instant::now();
        launch(&mut lc, t0);

        lc.step(Event::Shutdown);
        assert_eq!(lc.step(Event::Exited { code: Some(1) }), Action::Nothing);
        assert_eq!(lc.state(), State::Stopped);
        assert_eq!(lc.step(Event::CmdStart), Action::Nothing);
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn clean_exit_does_not_restart() {
        let mut lc = Lifecycle::new(policy(3));
        launch(&mut lc, Instant::now());
        assert_eq!(lc.step(Event::Exited { code: Some(0) }), Action::Nothing);
        assert_eq!(lc.state(), State::Stopped);
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn signal_death_counts_as_crash() {
        let mut lc = Lifecycle::new(policy(3));
        launch(&mut lc, Instant::now());
        assert_eq!(
            lc.step(Event::Exited { code: None }),
            Action::ScheduleRestart { attempt: 1 }
        );
    }

    #[test]
    fn spawn_failure_is_retried_once_for_free() {
        let mut lc = Lifecycle::new(policy(3));

        assert_eq!(lc.step(Event::CmdStart), Action::SpawnProcess);
        assert_eq!(lc.step(Event::SpawnFailed), Action::RetrySpawn);
        assert_eq!(lc.attempts(), 0);

        assert_eq!(lc.step(Event::CmdStart), Action::SpawnProcess);
        assert_eq!(
            lc.step(Event::SpawnFailed),
            Action::ScheduleRestart { attempt: 1 }
        );
    }

    #[test]
    fn successful_spawn_restores_the_free_retry() {
        let mut lc = Lifecycle::new(policy(3));

        assert_eq!(lc.step(Event::CmdStart), Action::SpawnProcess);
        assert_eq!(lc.step(Event::SpawnFailed), Action::RetrySpawn);
        launch(&mut lc, Instant::now());
        assert_eq!(
            lc.step(Event::Exited { code: Some(1) }),
            Action::ScheduleRestart { attempt: 1 }
        );

        // not consecutive with the first failure
        assert_eq!(lc.step(Event::CmdStart), Action::SpawnProcess);
        assert_eq!(lc.step(Event::SpawnFailed), Action::RetrySpawn);
        assert_eq!(lc.attempts(), 1);
    }

    #[test]
    fn shutdown_cancels_a_start_in_flight() {
        let mut lc = Lifecycle::new(policy(3));
        assert_eq!(lc.step(Event::CmdStart), Action::SpawnProcess);

        lc.step(Event::Shutdown);
        assert!(!lc.begin_stop(), "stops need an idle lifecycle");
        assert_eq!(lc.in_flight(), Some(InFlight::Start));

        // launch task saw the stop before spawning
        assert_eq!(lc.step(Event::Exited { code: None }), Action::Nothing);
        assert_eq!(lc.state(), State::Stopped);
        assert!(lc.is_idle());
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn no_second_start_while_one_is_pending_or_running() {
        let mut lc = Lifecycle::new(policy(3));
        assert_eq!(lc.step(Event::CmdStart), Action::SpawnProcess);
        assert_eq!(lc.step(Event::CmdStart), Action::Nothing);

        lc.step(Event::Spawned { at: Instant::now() });
        assert_eq!(lc.step(Event::CmdStart), Action::Nothing);
        assert!(lc.begin_stop());
        assert!(!lc.begin_stop());
    }

    #[test]
    fn zero_budget_crashes_on_first_exit() {
        let mut lc = Lifecycle::new(policy(0));
        launch(&mut lc, Instant::now());
        assert_eq!(lc.step(Event::Exited { code: Some(2) }), Action::GiveUp);
        assert_eq!(lc.state(), State::Crashed);
    }

    #[test]
    fn unsupervised_service_tracks_probe_results_only() {
        let mut lc = Lifecycle::new(policy(3));
        let now = Instant::now();

        lc.step(Event::ProbePassed { at: now });
        assert_eq!(lc.state(), State::Healthy);
        for _ in 0..5 {
            assert_eq!(lc.step(Event::ProbeFailed { at: now }), Action::Nothing);
        }
        assert_eq!(lc.state(), State::Unhealthy);
    }
}
