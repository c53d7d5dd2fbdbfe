//! Per-extruder filament state.
//!
//! Flags are derived from the signed filament delta of the latest movement
//! command and the running retraction accumulator. Triggers use them to gate
//! firing, e.g. "never while retracting".

use lapse_shared::config::ExtruderGate;

/// Deltas smaller than this are treated as zero.
pub const EXTRUSION_EPSILON: f64 = 1e-5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtruderState {
    /// Commanded E coordinate in the current (G92-adjusted) frame.
    pub e: f64,
    /// Signed filament delta of the latest movement command.
    pub e_relative: f64,
    pub extrusion_length: f64,
    pub extrusion_length_total: f64,
    /// Filament currently pulled back from the nozzle.
    pub retraction_length: f64,
    pub deretraction_length: f64,
    pub is_extruding_start: bool,
    pub is_extruding: bool,
    pub is_primed: bool,
    pub is_retracting_start: bool,
    pub is_retracting: bool,
    pub is_retracted: bool,
    pub is_partially_retracted: bool,
    pub is_deretracting_start: bool,
    pub is_deretracting: bool,
    pub is_deretracted: bool,
}

impl ExtruderState {
    pub fn new() -> Self {
        Self {
            is_primed: true,
            ..Default::default()
        }
    }

    /// Applies the filament delta of one movement command. `retract_length`
    /// is the printer's full retraction distance.
    pub fn apply_delta(&mut self, delta: f64, retract_length: f64) {
        let delta = if delta.abs() < EXTRUSION_EPSILON { 0.0 } else { delta };
        let was_extruding = self.is_extruding;
        let was_retracting = self.is_retracting;
        let was_deretracting = self.is_deretracting;
        let previous_retraction = self.retraction_length;

        self.e_relative = delta;
        self.extrusion_length = 0.0;
        self.deretraction_length = 0.0;

        if delta < 0.0 {
            self.retraction_length += -delta;
        } else if delta > 0.0 {
            let deretract = delta.min(self.retraction_length);
            self.retraction_length -= deretract;
            if self.retraction_length < EXTRUSION_EPSILON {
                self.retraction_length = 0.0;
            }
            self.deretraction_length = deretract;
            self.extrusion_length = delta - deretract;
            if self.extrusion_length < EXTRUSION_EPSILON {
                self.extrusion_length = 0.0;
            }
            self.extrusion_length_total += self.extrusion_length;
        }

        self.is_retracting = delta < 0.0;
        self.is_retracting_start = self.is_retracting && !was_retracting;
        self.is_deretracting = self.deretraction_length > 0.0;
        self.is_deretracting_start = self.is_deretracting && !was_deretracting;
        self.is_deretracted = previous_retraction > 0.0 && self.retraction_length == 0.0;
        self.is_extruding = self.extrusion_length > 0.0;
        self.is_extruding_start = self.is_extruding && !was_extruding;
        self.refresh_retraction_flags(retract_length);
        self.is_primed = !self.is_extruding && !self.is_deretracting && self.retraction_length == 0.0;
    }

    fn refresh_retraction_flags(&mut self, retract_length: f64) {
        if retract_length > 0.0 {
            self.is_retracted = self.retraction_length >= retract_length - EXTRUSION_EPSILON;
            self.is_partially_retracted = self.retraction_length > 0.0 && !self.is_retracted;
        } else {
            self.is_retracted = self.retraction_length > 0.0;
            self.is_partially_retracted = false;
        }
    }

    /// Whether the extrusion gate allows a trigger to fire in this state.
    ///
    /// Any flag set to `Some(false)` that is currently true closes the gate.
    /// Otherwise, if some flag is set to `Some(true)`, at least one of those
    /// must currently be true.
    pub fn satisfies(&self, gate: &ExtruderGate) -> bool {
        let checks = [
            (gate.on_extruding_start, self.is_extruding_start),
            (gate.on_extruding, self.is_extruding),
            (gate.on_primed, self.is_primed),
            (gate.on_retracting_start, self.is_retracting_start),
            (gate.on_retracting, self.is_retracting),
            (gate.on_partially_retracted, self.is_partially_retracted),
            (gate.on_retracted, self.is_retracted),
            (gate.on_deretracting_start, self.is_deretracting_start),
            (gate.on_deretracting, self.is_deretracting),
            (gate.on_deretracted, self.is_deretracted),
        ];
        if checks.iter().any(|(option, flag)| *option == Some(false) && *flag) {
            return false;
        }
        let mut required = checks.iter().filter(|(option, _)| *option == Some(true)).peekable();
        if required.peek().is_none() {
            return true;
        }
        required.any(|(_, flag)| *flag)
    }
}
