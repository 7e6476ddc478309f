// Message types exchanged with the runtime over zenoh

use serde::{Deserialize, Serialize};

use crate::lhystudios::{ControllerState, ControllerStats, MotionOp, StatusReport};

// Job from a planner or jog client -> runtime
// Ops run in order; a job that fails to encode is dropped from the failing op on
#[derive(Debug, Serialize, Deserialize)]
pub struct JobCommand {
    pub ops: Vec<MotionOp>,
}

/// Out-of-band requests, serviced ahead of queued jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    Abort,
    AbortWaiting,
    Shutdown,
}

/// Health published by the runtime every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerHealth {
    pub state: ControllerState,
    pub stats: ControllerStats,
    pub position: StatusReport,
    pub jobs_received: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}
