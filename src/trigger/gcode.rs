// src/trigger/gcode.rs - Fires when the configured snapshot token is queued
use lapse_shared::config::ExtruderGate;
use lapse_shared::gcode::normalize_command;

use super::{TriggerStatus, gate_open, position_ready};
use crate::position::PositionState;

#[derive(Debug, Clone)]
pub struct GcodeTrigger {
    token: String,
    gate: ExtruderGate,
    status: TriggerStatus,
}

impl GcodeTrigger {
    pub fn new(snapshot_command: &str, gate: ExtruderGate) -> Self {
        Self {
            token: normalize_command(snapshot_command),
            gate,
            status: TriggerStatus::default(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn update(&mut self, position: &PositionState, command: &str) {
        if !position_ready(position) {
            self.status.is_triggered = false;
            return;
        }
        let primary = normalize_command(command) == self.token;
        self.status.resolve(primary, gate_open(&self.gate, position));
    }

    pub fn status(&self) -> TriggerStatus {
        self.status
    }

    pub fn clear(&mut self) {
        self.status.clear();
    }
}
