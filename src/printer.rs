// src/printer.rs - Outbound interface from the coordinator to the print host
use serde::{Deserialize, Serialize};

/// Why a position echo was requested. Hosts pass it back with the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoReason {
    /// Where the print was when the trigger fired.
    ReturnPosition,
    /// Where the toolhead parked for the camera.
    SnapshotPosition,
    /// Where the toolhead ended up after the return batch.
    RestoredPosition,
}

/// Host operations used by the coordinator. Calls must not block; the
/// results arrive later through the coordinator's hooks.
pub trait PrinterControl: Send + Sync {
    fn pause_print(&self);
    fn resume_print(&self);
    /// Queues commands ahead of the print stream, in order.
    fn send_commands(&self, commands: &[String]);
    /// Asks the printer to report its position (M114 or equivalent).
    fn request_position_echo(&self, reason: EchoReason);
}
