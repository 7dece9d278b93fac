//! Failure taxonomy of the supervisor.
//!
//! None of these are fatal to the supervisor itself: each is handled inside
//! the component that observes it and shows up as a logged state transition.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS refused to create the process.
    #[error("{service}: failed to spawn `{command}`: {source}")]
    SpawnFailure {
        service: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Port still held by a foreign process after preemption.
    #[error("port {port} is still held by pid(s) {pids:?}")]
    PortConflict { port: u16, pids: Vec<i32> },

    #[error("{service}: health check timed out after {timeout:?}")]
    HealthCheckTimeout { service: String, timeout: Duration },

    #[error("{service}: health check refused: {reason}")]
    HealthCheckRefused { service: String, reason: String },

    #[error("{service}: health check answered with status {status}")]
    HealthCheckStatus { service: String, status: u16 },

    #[error("{service}: exited unexpectedly ({})", describe_exit(.code))]
    UnexpectedExit { service: String, code: Option<i32> },

    #[error("{service}: restart budget exhausted after {max_restarts} attempts")]
    RestartBudgetExhausted { service: String, max_restarts: u32 },
}

pub fn describe_exit(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("code {code}"),
        None => "killed by signal".to_string(),
    }
}
