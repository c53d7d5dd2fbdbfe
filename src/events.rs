//! Notifications emitted by the coordinator.
//!
//! Events are sent on an unbounded channel so emitting never blocks a
//! command hook. They serialize to tagged JSON for logging.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::print_job::PrintEndReason;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelapseEvent {
    PrintStarted {
        job_id: Uuid,
        print_file: String,
    },
    SnapshotStart {
        sequence: u32,
        trigger: String,
    },
    SnapshotComplete {
        sequence: u32,
        success: bool,
        error: Option<String>,
        path: Option<PathBuf>,
        /// Successful snapshots so far in this print.
        snapshot_count: u32,
        /// Time the print spent paused for this snapshot.
        seconds_added: f64,
    },
    PositionError {
        message: String,
    },
    RenderReady {
        job_id: Uuid,
        print_file: String,
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
        snapshot_count: u32,
        reason: PrintEndReason,
    },
}

impl TimelapseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TimelapseEvent::PrintStarted { .. } => "print_started",
            TimelapseEvent::SnapshotStart { .. } => "snapshot_start",
            TimelapseEvent::SnapshotComplete { .. } => "snapshot_complete",
            TimelapseEvent::PositionError { .. } => "position_error",
            TimelapseEvent::RenderReady { .. } => "render_ready",
        }
    }
}
