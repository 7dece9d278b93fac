use std::fmt;
use std::time::Instant;

/// Externally visible status of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
    /// Restart budget exhausted; terminal until the supervisor restarts.
    Crashed,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Healthy => "healthy",
            State::Unhealthy => "unhealthy",
            State::Crashed => "crashed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to a service's [`Lifecycle`](crate::lifecycle::Lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A (re)start is about to be issued.
    CmdStart,
    /// The OS created the process.
    Spawned { at: Instant },
    /// The OS refused to create the process.
    SpawnFailed,
    ProbePassed { at: Instant },
    ProbeFailed { at: Instant },
    /// The process is gone. `code` is `None` when it died from a signal.
    Exited { code: Option<i32> },
    /// Supervisor-wide shutdown has begun.
    Shutdown,
}

/// What the supervisor has to do in response to an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Nothing,
    SpawnProcess,
    /// Try spawning once more without touching the restart budget.
    RetrySpawn,
    /// Probes kept failing: stop the process, its exit feeds the budget.
    StopProcess,
    ScheduleRestart { attempt: u32 },
    GiveUp,
}
