// src/snapshot_plan.rs - Builds the parking and return command batches
//
// The parking batch moves the toolhead out of the camera's way and waits for
// motion to finish; the return batch undoes every change it made so the
// printer ends up exactly where the print left off, in the same modes.

use lapse_shared::config::{Axis, Bounds, PrinterConfig, SnapshotConfig};
use lapse_shared::gcode::{fmt_axis, fmt_extrusion, fmt_feedrate};
use thiserror::Error;
use tracing::debug;

use crate::extruder::EXTRUSION_EPSILON;
use crate::position::PositionState;
use crate::stabilization::Stabilization;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("Printer position is unknown")]
    UnknownPosition,
    #[error("Stabilization target {axis}={value:.3} is outside the printable volume")]
    OutOfBounds { axis: Axis, value: f64 },
    #[error("Stabilization path for axis {axis} is empty")]
    EmptyPath { axis: Axis },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPlan {
    pub snapshot_commands: Vec<String>,
    /// Index of the parking move in `snapshot_commands`.
    pub move_index: usize,
    /// Index of the last parking command. The position echo is requested
    /// once it has been sent.
    pub end_index: usize,
    /// Return batch followed by the replayed triggering command, if any.
    pub return_commands: Vec<String>,
    /// Index of the last command that restores the saved position. The
    /// restore echo is requested once it has been sent, before any replay.
    pub restore_end_index: usize,
    pub target_x: f64,
    pub target_y: f64,
    pub return_x: f64,
    pub return_y: f64,
    pub return_z: f64,
    pub retracted_length: f64,
    pub lifted: bool,
}

impl SnapshotPlan {
    pub fn parking_move(&self) -> &str {
        &self.snapshot_commands[self.move_index]
    }

    pub fn restore_commands(&self) -> &[String] {
        &self.return_commands[..=self.restore_end_index]
    }

    /// Commands following the restore batch.
    pub fn replay_commands(&self) -> &[String] {
        &self.return_commands[self.restore_end_index + 1..]
    }
}

/// Motion modes as they evolve through an emitted batch.
#[derive(Debug, Clone, Copy)]
struct Modes {
    relative: bool,
    extruder_relative: bool,
    g90_influences_extruder: bool,
}

impl Modes {
    fn set_relative(&mut self, out: &mut Vec<String>, relative: bool) {
        out.push(if relative { "G91" } else { "G90" }.to_string());
        self.relative = relative;
        if self.g90_influences_extruder {
            self.extruder_relative = relative;
        }
    }

    fn set_extruder_relative(&mut self, out: &mut Vec<String>, relative: bool) {
        out.push(if relative { "M83" } else { "M82" }.to_string());
        self.extruder_relative = relative;
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotPlanner {
    printer: PrinterConfig,
    snapshot: SnapshotConfig,
    bounds: Bounds,
    stabilization: Stabilization,
}

impl SnapshotPlanner {
    pub fn new(printer: &PrinterConfig, snapshot: &SnapshotConfig, stabilization: Stabilization) -> Self {
        Self {
            printer: printer.clone(),
            snapshot: snapshot.clone(),
            bounds: printer.volume.bounds(),
            stabilization,
        }
    }

    /// Builds the plan for the given pre-trigger position. `replay` is the
    /// triggering command to send once the return is confirmed, if any.
    pub fn create_plan(&mut self, position: &PositionState, replay: Option<&str>) -> Result<SnapshotPlan, PlanError> {
        let (Some(x), Some(y), Some(z)) = (position.x, position.y, position.z) else {
            return Err(PlanError::UnknownPosition);
        };
        let (target_x, target_y) = self.stabilization.next_target(Some(x), Some(y))?;
        let printer = &self.printer;
        let mut modes = Modes {
            relative: position.is_relative,
            extruder_relative: position.is_extruder_relative,
            g90_influences_extruder: printer.g90_influences_extruder,
        };

        let mut park = Vec::new();
        if modes.relative {
            modes.set_relative(&mut park, false);
        }

        let extruder = position.extruder();
        let retract = if self.snapshot.retract_before_move && printer.retract_length > 0.0 && !extruder.is_retracted {
            (printer.retract_length - extruder.retraction_length).max(0.0)
        } else {
            0.0
        };
        let retract = if retract < EXTRUSION_EPSILON { 0.0 } else { retract };
        if retract > 0.0 {
            if !modes.extruder_relative {
                modes.set_extruder_relative(&mut park, true);
            }
            park.push(format!("G1 E-{} F{}", fmt_extrusion(retract), fmt_feedrate(printer.retract_speed)));
        }

        let lift = self.snapshot.lift_before_move
            && printer.z_hop > 0.0
            && !position.is_zhop
            && self.bounds.contains(Axis::Z, z + printer.z_hop);
        if self.snapshot.lift_before_move && !lift {
            debug!("Skipping z-hop (zhop active: {}, z: {:.3})", position.is_zhop, z);
        }
        if lift {
            modes.set_relative(&mut park, true);
            park.push(format!("G1 Z{} F{}", fmt_axis(printer.z_hop), fmt_feedrate(printer.z_hop_speed)));
            modes.set_relative(&mut park, false);
        }

        let move_index = park.len();
        park.push(format!(
            "G1 X{} Y{} F{}",
            fmt_axis(target_x),
            fmt_axis(target_y),
            fmt_feedrate(printer.movement_speed)
        ));
        park.push("M400".to_string());
        if self.snapshot.delay_ms > 0 {
            park.push(format!("G4 P{}", self.snapshot.delay_ms));
        }
        let end_index = park.len() - 1;

        let mut ret = vec![format!(
            "G1 X{} Y{} F{}",
            fmt_axis(x),
            fmt_axis(y),
            fmt_feedrate(printer.movement_speed)
        )];
        if lift {
            modes.set_relative(&mut ret, true);
            ret.push(format!("G1 Z-{} F{}", fmt_axis(printer.z_hop), fmt_feedrate(printer.z_hop_speed)));
            modes.set_relative(&mut ret, false);
        }
        if retract > 0.0 {
            if !modes.extruder_relative {
                modes.set_extruder_relative(&mut ret, true);
            }
            ret.push(format!("G1 E{} F{}", fmt_extrusion(retract), fmt_feedrate(printer.deretract_speed)));
        }
        if modes.relative != position.is_relative {
            modes.set_relative(&mut ret, position.is_relative);
        }
        if modes.extruder_relative != position.is_extruder_relative {
            modes.set_extruder_relative(&mut ret, position.is_extruder_relative);
        }
        if let Some(f) = position.f {
            ret.push(format!("G1 F{}", fmt_feedrate(f)));
        }
        let restore_end_index = ret.len() - 1;
        if let Some(command) = replay {
            ret.push(command.trim().to_string());
        }

        Ok(SnapshotPlan {
            snapshot_commands: park,
            move_index,
            end_index,
            return_commands: ret,
            restore_end_index,
            target_x,
            target_y,
            return_x: x,
            return_y: y,
            return_z: z,
            retracted_length: retract,
            lifted: lift,
        })
    }
}
