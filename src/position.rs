// src/position.rs - Printer position tracker fed by the outgoing command stream
//
// The tracker interprets every command the host is about to send and keeps a
// model of where the toolhead will be once the printer executes it. One level
// of history is kept so a triggering command can be taken back and replayed
// after the snapshot.

use lapse_shared::config::{Axis, Bounds, PrinterConfig};
use lapse_shared::gcode::ParsedCommand;
use tracing::{debug, warn};

use crate::extruder::{EXTRUSION_EPSILON, ExtruderState};

const INCH_TO_MM: f64 = 25.4;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionState {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    /// Last commanded feed rate, mm/min.
    pub f: Option<f64>,
    pub is_relative: bool,
    pub is_extruder_relative: bool,
    pub is_metric: bool,
    pub homed_x: bool,
    pub homed_y: bool,
    pub homed_z: bool,
    pub current_tool: usize,
    pub extruders: Vec<ExtruderState>,
    pub layer: u32,
    /// Highest Z at which extrusion has happened.
    pub height: f64,
    pub last_extrusion_height: Option<f64>,
    pub is_layer_change: bool,
    pub is_zhop: bool,
    pub is_in_bounds: bool,
    /// Whether the last command moved X, Y or Z.
    pub has_position_changed: bool,
    pub last_command: Option<String>,
}

impl PositionState {
    pub fn new(num_extruders: usize) -> Self {
        Self {
            x: None,
            y: None,
            z: None,
            f: None,
            is_relative: false,
            is_extruder_relative: false,
            is_metric: true,
            homed_x: false,
            homed_y: false,
            homed_z: false,
            current_tool: 0,
            extruders: vec![ExtruderState::new(); num_extruders.max(1)],
            layer: 0,
            height: 0.0,
            last_extrusion_height: None,
            is_layer_change: false,
            is_zhop: false,
            is_in_bounds: true,
            has_position_changed: false,
            last_command: None,
        }
    }

    pub fn has_known_position(&self) -> bool {
        self.x.is_some() && self.y.is_some() && self.z.is_some()
    }

    pub fn coordinate(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// State of the active extruder.
    pub fn extruder(&self) -> &ExtruderState {
        let index = self.current_tool.min(self.extruders.len() - 1);
        &self.extruders[index]
    }

    fn extruder_mut(&mut self) -> &mut ExtruderState {
        let index = self.current_tool.min(self.extruders.len() - 1);
        &mut self.extruders[index]
    }

    fn set_coordinate(&mut self, axis: Axis, value: Option<f64>) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    printer: PrinterConfig,
    bounds: Bounds,
    current: PositionState,
    previous: Option<PositionState>,
    saved: Option<PositionState>,
}

impl Position {
    pub fn new(printer: &PrinterConfig) -> Self {
        Self {
            printer: printer.clone(),
            bounds: printer.volume.bounds(),
            current: PositionState::new(printer.num_extruders),
            previous: None,
            saved: None,
        }
    }

    pub fn state(&self) -> &PositionState {
        &self.current
    }

    pub fn saved_position(&self) -> Option<&PositionState> {
        self.saved.as_ref()
    }

    /// Interprets one outgoing command. Unparseable lines only update the
    /// raw-command bookkeeping.
    pub fn update(&mut self, raw: &str) {
        self.previous = Some(self.current.clone());
        self.current.is_layer_change = false;
        self.current.has_position_changed = false;
        self.current.last_command = Some(raw.trim().to_string());

        let cmd = match ParsedCommand::parse(raw) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("Position tracker skipped '{}': {}", raw.trim(), e);
                return;
            }
        };

        match cmd.command.as_str() {
            "G0" | "G1" | "G2" | "G3" => self.process_move(&cmd),
            "G10" => self.process_firmware_retract(),
            "G11" => self.process_firmware_deretract(),
            "G20" => self.current.is_metric = false,
            "G21" => self.current.is_metric = true,
            "G28" => self.process_home(&cmd),
            "G90" => {
                self.current.is_relative = false;
                if self.printer.g90_influences_extruder {
                    self.current.is_extruder_relative = false;
                }
            }
            "G91" => {
                self.current.is_relative = true;
                if self.printer.g90_influences_extruder {
                    self.current.is_extruder_relative = true;
                }
            }
            "G92" => self.process_set_position(&cmd),
            "M82" => self.current.is_extruder_relative = false,
            "M83" => self.current.is_extruder_relative = true,
            tool if tool.starts_with('T') => self.process_tool_change(tool),
            _ => {}
        }
    }

    /// Restores the state from before the latest `update`. Only one level
    /// is kept; returns false when there is nothing to undo.
    pub fn undo_update(&mut self) -> bool {
        match self.previous.take() {
            Some(previous) => {
                self.current = previous;
                true
            }
            None => false,
        }
    }

    pub fn save_position(&mut self) {
        self.saved = Some(self.current.clone());
    }

    /// Whether the given coordinates match the saved position within
    /// `tolerance`. Axes unknown at save time are not compared.
    pub fn is_at_saved_position(&self, x: f64, y: f64, z: f64, tolerance: f64) -> bool {
        let Some(saved) = &self.saved else {
            return false;
        };
        [(saved.x, x), (saved.y, y), (saved.z, z)]
            .iter()
            .all(|(expected, actual)| expected.is_none_or(|e| (e - actual).abs() <= tolerance))
    }

    /// Adopts coordinates reported by the printer.
    pub fn set_from_echo(&mut self, x: f64, y: f64, z: f64) {
        self.current.x = Some(x);
        self.current.y = Some(y);
        self.current.z = Some(z);
        self.previous = None;
        self.refresh_bounds();
    }

    fn unit_scale(&self) -> f64 {
        if self.current.is_metric { 1.0 } else { INCH_TO_MM }
    }

    fn process_move(&mut self, cmd: &ParsedCommand) {
        let scale = self.unit_scale();
        let before = (self.current.x, self.current.y, self.current.z);

        for (letter, axis) in [('X', Axis::X), ('Y', Axis::Y), ('Z', Axis::Z)] {
            let Some(value) = cmd.parameter(letter) else {
                continue;
            };
            let value = value * scale;
            let updated = if self.current.is_relative {
                match self.current.coordinate(axis) {
                    Some(current) => Some(current + value),
                    None => {
                        debug!("Relative {} move with unknown position", axis);
                        None
                    }
                }
            } else {
                Some(value)
            };
            self.current.set_coordinate(axis, updated);
        }

        if let Some(f) = cmd.parameter('F') {
            self.current.f = Some(f * scale);
        }

        let delta = match cmd.parameter('E') {
            Some(e) => {
                let e = e * scale;
                let relative = self.current.is_extruder_relative;
                let extruder = self.current.extruder_mut();
                if relative {
                    extruder.e += e;
                    e
                } else {
                    let delta = e - extruder.e;
                    extruder.e = e;
                    delta
                }
            }
            None => 0.0,
        };
        let retract_length = self.printer.retract_length;
        self.current.extruder_mut().apply_delta(delta, retract_length);

        self.current.has_position_changed = before != (self.current.x, self.current.y, self.current.z);
        self.refresh_layer();
        self.refresh_bounds();
    }

    fn process_firmware_retract(&mut self) {
        let retract_length = self.printer.retract_length;
        let extruder = self.current.extruder_mut();
        let remaining = (retract_length - extruder.retraction_length).max(0.0);
        extruder.apply_delta(-remaining, retract_length);
        self.refresh_layer();
    }

    fn process_firmware_deretract(&mut self) {
        let retract_length = self.printer.retract_length;
        let extruder = self.current.extruder_mut();
        let retracted = extruder.retraction_length;
        extruder.apply_delta(retracted, retract_length);
        self.refresh_layer();
    }

    fn process_home(&mut self, cmd: &ParsedCommand) {
        let listed: Vec<Axis> = [('X', Axis::X), ('Y', Axis::Y), ('Z', Axis::Z)]
            .into_iter()
            .filter(|(letter, _)| cmd.has_parameter(*letter))
            .map(|(_, axis)| axis)
            .collect();
        let axes = if listed.is_empty() { vec![Axis::X, Axis::Y, Axis::Z] } else { listed };
        for axis in axes {
            let home = match axis {
                Axis::X => {
                    self.current.homed_x = true;
                    self.printer.home_x
                }
                Axis::Y => {
                    self.current.homed_y = true;
                    self.printer.home_y
                }
                Axis::Z => {
                    self.current.homed_z = true;
                    self.printer.home_z
                }
            };
            self.current.set_coordinate(axis, Some(home));
        }
        self.current.has_position_changed = true;
        self.refresh_layer();
        self.refresh_bounds();
    }

    fn process_set_position(&mut self, cmd: &ParsedCommand) {
        let scale = self.unit_scale();
        let any = ['X', 'Y', 'Z', 'E'].iter().any(|l| cmd.has_parameter(*l));
        for (letter, axis) in [('X', Axis::X), ('Y', Axis::Y), ('Z', Axis::Z)] {
            if !any {
                self.current.set_coordinate(axis, Some(0.0));
            } else if cmd.has_parameter(letter) {
                let value = cmd.parameter(letter).unwrap_or(0.0) * scale;
                self.current.set_coordinate(axis, Some(value));
            }
        }
        if !any || cmd.has_parameter('E') {
            let value = cmd.parameter('E').unwrap_or(0.0) * scale;
            self.current.extruder_mut().e = value;
        }
        self.refresh_bounds();
    }

    fn process_tool_change(&mut self, token: &str) {
        match token[1..].parse::<usize>() {
            Ok(tool) if tool < self.current.extruders.len() => self.current.current_tool = tool,
            _ => warn!("Ignoring tool change to unknown tool '{}'", token),
        }
    }

    fn refresh_layer(&mut self) {
        let extruding = self.current.extruder().is_extruding;
        if let (true, Some(z)) = (extruding, self.current.z) {
            let above = self
                .current
                .last_extrusion_height
                .is_none_or(|last| z > last + EXTRUSION_EPSILON);
            if above {
                self.current.layer += 1;
                self.current.is_layer_change = true;
                self.current.last_extrusion_height = Some(z);
                self.current.height = self.current.height.max(z);
            }
        }

        let z_hop = self.printer.z_hop;
        self.current.is_zhop = match (self.current.z, self.current.last_extrusion_height) {
            (Some(z), Some(last)) if z_hop > 0.0 && !extruding => z - last >= z_hop - EXTRUSION_EPSILON,
            _ => false,
        };
    }

    fn refresh_bounds(&mut self) {
        let in_bounds = [Axis::X, Axis::Y, Axis::Z]
            .into_iter()
            .all(|axis| self.current.coordinate(axis).is_none_or(|v| self.bounds.contains(axis, v)));
        self.current.is_in_bounds = in_bounds;
    }
}
