// src/trigger/mod.rs - Snapshot trigger engine
//
// Each trigger evaluates the tracked position after every command. A trigger
// whose primary condition holds while its extrusion gate is closed becomes
// "waiting" and fires on the first later command where the gate opens.

pub mod gcode;
pub mod layer;
pub mod timer;

use std::sync::Arc;

use lapse_shared::TimeInterface;
use lapse_shared::config::{ExtruderGate, PrinterConfig, TriggerConfig, TriggerKind};
use tracing::debug;

use crate::position::PositionState;

pub use gcode::GcodeTrigger;
pub use layer::LayerTrigger;
pub use timer::TimerTrigger;

/// Per-trigger firing state. `is_triggered` and `is_waiting` are never both set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStatus {
    pub is_triggered: bool,
    pub is_waiting: bool,
}

impl TriggerStatus {
    /// Folds a primary condition and the gate result into the status.
    pub(crate) fn resolve(&mut self, primary: bool, gate_open: bool) {
        if primary || self.is_waiting {
            self.is_triggered = gate_open;
            self.is_waiting = !gate_open;
        } else {
            self.is_triggered = false;
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Position prerequisites shared by all triggers.
pub(crate) fn position_ready(position: &PositionState) -> bool {
    position.has_known_position() && position.is_in_bounds
}

pub(crate) fn gate_open(gate: &ExtruderGate, position: &PositionState) -> bool {
    position.extruder().satisfies(gate)
}

#[derive(Debug)]
pub enum Trigger {
    Gcode(GcodeTrigger),
    Timer(TimerTrigger),
    Layer(LayerTrigger),
}

impl Trigger {
    pub fn from_config(config: &TriggerConfig, printer: &PrinterConfig, clock: Arc<dyn TimeInterface>) -> Self {
        match &config.kind {
            TriggerKind::Gcode => Trigger::Gcode(GcodeTrigger::new(&printer.snapshot_command, config.extruder)),
            TriggerKind::Timer { interval_seconds } => {
                Trigger::Timer(TimerTrigger::new(*interval_seconds, config.extruder, clock))
            }
            TriggerKind::Layer { z_min, height_increment, require_zhop } => {
                Trigger::Layer(LayerTrigger::new(*z_min, *height_increment, *require_zhop, config.extruder))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Gcode(_) => "gcode",
            Trigger::Timer(_) => "timer",
            Trigger::Layer(_) => "layer",
        }
    }

    pub fn update(&mut self, position: &PositionState, command: &str) {
        match self {
            Trigger::Gcode(t) => t.update(position, command),
            Trigger::Timer(t) => t.update(position),
            Trigger::Layer(t) => t.update(position),
        }
    }

    pub fn status(&self) -> TriggerStatus {
        match self {
            Trigger::Gcode(t) => t.status(),
            Trigger::Timer(t) => t.status(),
            Trigger::Layer(t) => t.status(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.status().is_triggered
    }

    pub fn is_waiting(&self) -> bool {
        self.status().is_waiting
    }

    /// Clears firing state after a snapshot was taken. Timers start a new
    /// interval.
    pub fn reset(&mut self) {
        match self {
            Trigger::Gcode(t) => t.clear(),
            Trigger::Timer(t) => t.restart_interval(),
            Trigger::Layer(t) => t.clear(),
        }
    }
}

/// Ordered collection of the configured triggers.
#[derive(Debug, Default)]
pub struct Triggers {
    triggers: Vec<Trigger>,
}

impl Triggers {
    pub fn new(configs: &[TriggerConfig], printer: &PrinterConfig, clock: Arc<dyn TimeInterface>) -> Self {
        let triggers = configs
            .iter()
            .map(|config| Trigger::from_config(config, printer, clock.clone()))
            .collect();
        Self { triggers }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter()
    }

    pub fn update(&mut self, position: &PositionState, command: &str) {
        for trigger in &mut self.triggers {
            trigger.update(position, command);
            let status = trigger.status();
            if status.is_waiting {
                debug!("{} trigger waiting for extruder state", trigger.name());
            }
        }
    }

    /// First trigger, in configuration order, that fired on the last update.
    pub fn first_triggering(&self) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.is_triggered())
    }

    pub fn is_waiting(&self) -> bool {
        self.triggers.iter().any(|t| t.is_waiting())
    }

    pub fn reset(&mut self) {
        self.triggers.iter_mut().for_each(Trigger::reset);
    }

    pub fn pause(&mut self) {
        for trigger in &mut self.triggers {
            if let Trigger::Timer(t) = trigger {
                t.pause();
            }
        }
    }

    pub fn resume(&mut self) {
        for trigger in &mut self.triggers {
            if let Trigger::Timer(t) = trigger {
                t.resume();
            }
        }
    }
}
