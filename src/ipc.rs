//! Messages carried on the supervisor bus.
//!
//! Every asynchronous happening (process spawned or gone, probe finished,
//! shutdown requested) becomes one `Evt` consumed by the single control loop,
//! which is the only place service state is mutated.

use chrono::{DateTime, Utc};

use crate::error::SupervisorError;
use crate::health::HealthResult;

#[derive(Debug)]
pub enum Evt {
    Spawned {
        service: String,
        generation: u64,
        pid: u32,
        ts: DateTime<Utc>,
    },
    SpawnFailed {
        service: String,
        generation: u64,
        error: SupervisorError,
    },
    Exited {
        service: String,
        generation: u64,
        code: Option<i32>,
        /// SIGKILL was needed after the grace period.
        forced: bool,
        ts: DateTime<Utc>,
    },
    Health {
        service: String,
        generation: u64,
        result: HealthResult,
    },
    Shutdown {
        reason: String,
    },
}
