//! Timelapse configuration, loaded once per print from a TOML document.
//!
//! ## Example
//!
//! ```toml
//! [printer]
//! printer_name = "MK3S"
//! movement_speed = 6000.0
//! z_hop = 0.5
//! retract_length = 1.0
//!
//! [printer.volume]
//! bed_type = "rectangular"
//! width = 250.0
//! depth = 210.0
//! height = 210.0
//!
//! [stabilization.x]
//! type = "fixed"
//! coordinate = 0.0
//!
//! [stabilization.y]
//! type = "relative_path"
//! path = [0.0, 50.0, 100.0]
//! loop_path = true
//!
//! [[triggers]]
//! type = "layer"
//! z_min = 0.3
//!
//! [triggers.extruder]
//! on_retracting = false
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LapseConfig {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub stabilization: StabilizationConfig,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub camera: CameraConfig,
}

impl Default for LapseConfig {
    fn default() -> Self {
        Self {
            printer: PrinterConfig::default(),
            snapshot: SnapshotConfig::default(),
            stabilization: StabilizationConfig::default(),
            triggers: default_triggers(),
            camera: CameraConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub printer_name: Option<String>,
    /// Travel speed for stabilization moves, mm/min.
    #[serde(default = "default_movement_speed")]
    pub movement_speed: f64,
    #[serde(default = "default_z_hop")]
    pub z_hop: f64,
    #[serde(default = "default_z_hop_speed")]
    pub z_hop_speed: f64,
    #[serde(default = "default_retract_length")]
    pub retract_length: f64,
    #[serde(default = "default_retract_speed")]
    pub retract_speed: f64,
    #[serde(default = "default_retract_speed")]
    pub deretract_speed: f64,
    #[serde(default = "default_snapshot_command")]
    pub snapshot_command: String,
    #[serde(default = "default_num_extruders")]
    pub num_extruders: usize,
    /// Some firmwares switch the extruder mode together with G90/G91.
    #[serde(default)]
    pub g90_influences_extruder: bool,
    #[serde(default)]
    pub home_x: f64,
    #[serde(default)]
    pub home_y: f64,
    #[serde(default)]
    pub home_z: f64,
    #[serde(default)]
    pub volume: VolumeConfig,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            printer_name: None,
            movement_speed: default_movement_speed(),
            z_hop: default_z_hop(),
            z_hop_speed: default_z_hop_speed(),
            retract_length: default_retract_length(),
            retract_speed: default_retract_speed(),
            deretract_speed: default_retract_speed(),
            snapshot_command: default_snapshot_command(),
            num_extruders: default_num_extruders(),
            g90_influences_extruder: false,
            home_x: 0.0,
            home_y: 0.0,
            home_z: 0.0,
            volume: VolumeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BedOrigin {
    #[default]
    FrontLeft,
    Center,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "bed_type", rename_all = "snake_case")]
pub enum VolumeConfig {
    Rectangular {
        width: f64,
        depth: f64,
        height: f64,
        #[serde(default)]
        origin: BedOrigin,
    },
    Custom {
        min_x: f64,
        max_x: f64,
        min_y: f64,
        max_y: f64,
        min_z: f64,
        max_z: f64,
    },
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig::Rectangular {
            width: 250.0,
            depth: 210.0,
            height: 210.0,
            origin: BedOrigin::FrontLeft,
        }
    }
}

impl VolumeConfig {
    pub fn bounds(&self) -> Bounds {
        match *self {
            VolumeConfig::Rectangular { width, depth, height, origin: BedOrigin::FrontLeft } => Bounds {
                min_x: 0.0,
                max_x: width,
                min_y: 0.0,
                max_y: depth,
                min_z: 0.0,
                max_z: height,
            },
            VolumeConfig::Rectangular { width, depth, height, origin: BedOrigin::Center } => Bounds {
                min_x: -width / 2.0,
                max_x: width / 2.0,
                min_y: -depth / 2.0,
                max_y: depth / 2.0,
                min_z: 0.0,
                max_z: height,
            },
            VolumeConfig::Custom { min_x, max_x, min_y, max_y, min_z, max_z } => Bounds {
                min_x,
                max_x,
                min_y,
                max_y,
                min_z,
                max_z,
            },
        }
    }
}

/// Axis-aligned printable volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

impl Bounds {
    const TOLERANCE: f64 = 1e-6;

    pub fn range(&self, axis: Axis) -> (f64, f64) {
        match axis {
            Axis::X => (self.min_x, self.max_x),
            Axis::Y => (self.min_y, self.max_y),
            Axis::Z => (self.min_z, self.max_z),
        }
    }

    pub fn contains(&self, axis: Axis, value: f64) -> bool {
        let (min, max) = self.range(axis);
        value >= min - Self::TOLERANCE && value <= max + Self::TOLERANCE
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_true")]
    pub retract_before_move: bool,
    #[serde(default = "default_true")]
    pub lift_before_move: bool,
    /// Settle time after parking, milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Allowed difference between expected and echoed coordinates, mm.
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
    #[serde(default = "default_position_retries")]
    pub position_retries: u32,
    #[serde(default = "default_position_timeout_ms")]
    pub position_timeout_ms: u64,
    /// Triggering commands in this list are dropped rather than replayed.
    #[serde(default = "default_suppressed_commands")]
    pub suppressed_commands: Vec<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_filename_template")]
    pub filename_template: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retract_before_move: true,
            lift_before_move: true,
            delay_ms: default_delay_ms(),
            position_tolerance: default_position_tolerance(),
            position_retries: default_position_retries(),
            position_timeout_ms: default_position_timeout_ms(),
            suppressed_commands: default_suppressed_commands(),
            output_dir: default_output_dir(),
            filename_template: default_filename_template(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StabilizationConfig {
    #[serde(default = "default_axis_stabilization")]
    pub x: AxisStabilization,
    #[serde(default = "default_axis_stabilization")]
    pub y: AxisStabilization,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            x: default_axis_stabilization(),
            y: default_axis_stabilization(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AxisStabilization {
    Disabled,
    Fixed {
        coordinate: f64,
    },
    FixedPath {
        path: Vec<f64>,
        #[serde(default)]
        loop_path: bool,
        #[serde(default)]
        invert_loop: bool,
    },
    Relative {
        percent: f64,
    },
    RelativePath {
        path: Vec<f64>,
        #[serde(default)]
        loop_path: bool,
        #[serde(default)]
        invert_loop: bool,
    },
}

impl AxisStabilization {
    pub fn validate(&self, axis: &str) -> Result<(), String> {
        let check_finite = |v: f64| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(format!("Stabilization coordinate for axis '{}' must be finite, got {}", axis, v))
            }
        };
        let check_percent = |p: f64| {
            if (0.0..=100.0).contains(&p) {
                Ok(())
            } else {
                Err(format!("Stabilization percent for axis '{}' must be between 0 and 100, got {}", axis, p))
            }
        };
        match self {
            AxisStabilization::Disabled => Ok(()),
            AxisStabilization::Fixed { coordinate } => check_finite(*coordinate),
            AxisStabilization::Relative { percent } => check_percent(*percent),
            AxisStabilization::FixedPath { path, .. } => {
                if path.is_empty() {
                    return Err(format!("Stabilization path for axis '{}' must not be empty", axis));
                }
                path.iter().try_for_each(|v| check_finite(*v))
            }
            AxisStabilization::RelativePath { path, .. } => {
                if path.is_empty() {
                    return Err(format!("Stabilization path for axis '{}' must not be empty", axis));
                }
                path.iter().try_for_each(|p| check_percent(*p))
            }
        }
    }
}

/// Per-flag extrusion gate. `None` ignores the flag, `Some(true)` allows the
/// trigger to fire while the flag is set, `Some(false)` blocks it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct ExtruderGate {
    #[serde(default)]
    pub on_extruding_start: Option<bool>,
    #[serde(default)]
    pub on_extruding: Option<bool>,
    #[serde(default)]
    pub on_primed: Option<bool>,
    #[serde(default)]
    pub on_retracting_start: Option<bool>,
    #[serde(default)]
    pub on_retracting: Option<bool>,
    #[serde(default)]
    pub on_partially_retracted: Option<bool>,
    #[serde(default)]
    pub on_retracted: Option<bool>,
    #[serde(default)]
    pub on_deretracting_start: Option<bool>,
    #[serde(default)]
    pub on_deretracting: Option<bool>,
    #[serde(default)]
    pub on_deretracted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Gcode,
    Timer {
        interval_seconds: f64,
    },
    Layer {
        #[serde(default)]
        z_min: Option<f64>,
        #[serde(default)]
        height_increment: Option<f64>,
        #[serde(default)]
        require_zhop: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TriggerConfig {
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub extruder: ExtruderGate,
}

impl TriggerConfig {
    pub fn new(kind: TriggerKind) -> Self {
        Self { kind, extruder: ExtruderGate::default() }
    }

    pub fn with_gate(mut self, gate: ExtruderGate) -> Self {
        self.extruder = gate;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CameraSetting {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_snapshot_url")]
    pub snapshot_url: String,
    #[serde(default = "default_camera_timeout_ms")]
    pub timeout_ms: u64,
    /// Some webcam servers reject concurrent connections.
    #[serde(default = "default_true")]
    pub serialize_requests: bool,
    /// URL with `{name}` and `{value}` placeholders, one request per setting.
    #[serde(default)]
    pub settings_url_template: Option<String>,
    #[serde(default)]
    pub settings: Vec<CameraSetting>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_url: default_snapshot_url(),
            timeout_ms: default_camera_timeout_ms(),
            serialize_requests: true,
            settings_url_template: None,
            settings: Vec::new(),
        }
    }
}

impl LapseConfig {
    pub fn validate(&self) -> Result<(), String> {
        let p = &self.printer;
        for (name, speed) in [
            ("movement_speed", p.movement_speed),
            ("z_hop_speed", p.z_hop_speed),
            ("retract_speed", p.retract_speed),
            ("deretract_speed", p.deretract_speed),
        ] {
            if !speed.is_finite() || speed <= 0.0 {
                return Err(format!("Printer {} must be a finite value > 0", name));
            }
        }
        for (name, value) in [("z_hop", p.z_hop), ("retract_length", p.retract_length)] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("Printer {} must be a finite value >= 0", name));
            }
        }
        for (name, value) in [("home_x", p.home_x), ("home_y", p.home_y), ("home_z", p.home_z)] {
            if !value.is_finite() {
                return Err(format!("Printer {} must be finite", name));
            }
        }
        if p.num_extruders == 0 {
            return Err("Printer num_extruders must be >= 1".to_string());
        }
        if p.snapshot_command.trim().is_empty() {
            return Err("Printer snapshot_command must not be empty".to_string());
        }
        let b = p.volume.bounds();
        if [b.min_x, b.max_x, b.min_y, b.max_y, b.min_z, b.max_z].iter().any(|v| !v.is_finite()) {
            return Err("Printer volume must be finite on every axis".to_string());
        }
        if b.min_x >= b.max_x || b.min_y >= b.max_y || b.min_z >= b.max_z {
            return Err("Printer volume must have positive extent on every axis".to_string());
        }
        if !self.snapshot.position_tolerance.is_finite() || self.snapshot.position_tolerance < 0.0 {
            return Err("Snapshot position_tolerance must be a finite value >= 0".to_string());
        }
        if self.snapshot.position_timeout_ms == 0 {
            return Err("Snapshot position_timeout_ms must be > 0".to_string());
        }
        self.stabilization.x.validate("x")?;
        self.stabilization.y.validate("y")?;
        for trigger in &self.triggers {
            match &trigger.kind {
                TriggerKind::Timer { interval_seconds } if !interval_seconds.is_finite() || *interval_seconds <= 0.0 => {
                    return Err("Timer trigger interval_seconds must be a finite value > 0".to_string());
                }
                TriggerKind::Layer { height_increment: Some(inc), .. } if !inc.is_finite() || *inc <= 0.0 => {
                    return Err("Layer trigger height_increment must be a finite value > 0".to_string());
                }
                TriggerKind::Layer { z_min: Some(z), .. } if !z.is_finite() => {
                    return Err("Layer trigger z_min must be finite".to_string());
                }
                _ => {}
            }
        }
        if self.camera.timeout_ms == 0 {
            return Err("Camera timeout_ms must be > 0".to_string());
        }
        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_movement_speed() -> f64 { 6000.0 }
fn default_z_hop() -> f64 { 0.5 }
fn default_z_hop_speed() -> f64 { 1200.0 }
fn default_retract_length() -> f64 { 1.0 }
fn default_retract_speed() -> f64 { 2400.0 }
fn default_snapshot_command() -> String { "@SNAPSHOT".to_string() }
fn default_num_extruders() -> usize { 1 }
fn default_delay_ms() -> u64 { 125 }
fn default_position_tolerance() -> f64 { 0.005 }
fn default_position_retries() -> u32 { 3 }
fn default_position_timeout_ms() -> u64 { 10_000 }
fn default_suppressed_commands() -> Vec<String> { vec!["M114".to_string()] }
fn default_output_dir() -> String { "snapshots".to_string() }
fn default_filename_template() -> String { "{print_name}_{sequence}.jpg".to_string() }
fn default_axis_stabilization() -> AxisStabilization { AxisStabilization::Relative { percent: 50.0 } }
fn default_triggers() -> Vec<TriggerConfig> { vec![TriggerConfig::new(TriggerKind::Gcode)] }
fn default_snapshot_url() -> String { "http://127.0.0.1:8080/?action=snapshot".to_string() }
fn default_camera_timeout_ms() -> u64 { 5000 }

pub fn load_config(path: &str) -> Result<LapseConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: LapseConfig = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate().map_err(|msg| {
        tracing::error!("Rejected config '{}': {}", path, msg);
        ConfigError::Invalid(msg)
    })?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LapseConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.triggers.len(), 1);
        let parsed: LapseConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.triggers, vec![TriggerConfig::new(TriggerKind::Gcode)]);
    }

    #[test]
    fn test_center_origin_bounds() {
        let volume = VolumeConfig::Rectangular { width: 200.0, depth: 100.0, height: 50.0, origin: BedOrigin::Center };
        let b = volume.bounds();
        assert_eq!(b.range(Axis::X), (-100.0, 100.0));
        assert_eq!(b.range(Axis::Y), (-50.0, 50.0));
        assert!(b.contains(Axis::Z, 50.0));
        assert!(!b.contains(Axis::Z, 50.1));
    }

    #[test]
    fn test_tagged_sections_parse() {
        let toml_str = r#"
            [printer.volume]
            bed_type = "custom"
            min_x = -10.0
            max_x = 200.0
            min_y = 0.0
            max_y = 200.0
            min_z = 0.0
            max_z = 180.0

            [stabilization.x]
            type = "fixed_path"
            path = [0.0, 10.0]
            loop_path = true

            [[triggers]]
            type = "timer"
            interval_seconds = 30.0

            [triggers.extruder]
            on_retracting = false
        "#;
        let config: LapseConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.printer.volume.bounds().min_x, -10.0);
        assert_eq!(
            config.stabilization.x,
            AxisStabilization::FixedPath { path: vec![0.0, 10.0], loop_path: true, invert_loop: false }
        );
        assert_eq!(config.triggers[0].kind, TriggerKind::Timer { interval_seconds: 30.0 });
        assert_eq!(config.triggers[0].extruder.on_retracting, Some(false));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = LapseConfig::default();
        config.stabilization.y = AxisStabilization::Relative { percent: 120.0 };
        assert!(config.validate().is_err());

        let mut config = LapseConfig::default();
        config.printer.movement_speed = 0.0;
        assert!(config.validate().is_err());

        let mut config = LapseConfig::default();
        config.triggers.push(TriggerConfig::new(TriggerKind::Layer {
            z_min: None,
            height_increment: Some(0.0),
            require_zhop: false,
        }));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_values() {
        for interval_seconds in [f64::INFINITY, f64::NAN] {
            let mut config = LapseConfig::default();
            config.triggers = vec![TriggerConfig::new(TriggerKind::Timer { interval_seconds })];
            assert!(config.validate().is_err(), "{}", interval_seconds);
        }

        let mut config = LapseConfig::default();
        config.snapshot.position_tolerance = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = LapseConfig::default();
        config.printer.movement_speed = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = LapseConfig::default();
        config.printer.z_hop = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = LapseConfig::default();
        config.stabilization.x = AxisStabilization::Fixed { coordinate: f64::NAN };
        assert!(config.validate().is_err());

        let mut config = LapseConfig::default();
        config.stabilization.y = AxisStabilization::FixedPath {
            path: vec![0.0, f64::INFINITY],
            loop_path: false,
            invert_loop: false,
        };
        assert!(config.validate().is_err());

        let mut config = LapseConfig::default();
        config.triggers = vec![TriggerConfig::new(TriggerKind::Layer {
            z_min: Some(f64::NAN),
            height_increment: None,
            require_zhop: false,
        })];
        assert!(config.validate().is_err());
        assert!(LapseConfig::default().validate().is_ok());
    }
}
