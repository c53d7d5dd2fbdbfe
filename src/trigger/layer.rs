// src/trigger/layer.rs - Fires on layer changes, optionally every N mm of height
use lapse_shared::config::ExtruderGate;

use super::{TriggerStatus, gate_open, position_ready};
use crate::extruder::EXTRUSION_EPSILON;
use crate::position::PositionState;

#[derive(Debug, Clone)]
pub struct LayerTrigger {
    z_min: Option<f64>,
    height_increment: Option<f64>,
    require_zhop: bool,
    gate: ExtruderGate,
    /// Height the next increment-based snapshot waits for.
    next_height: Option<f64>,
    status: TriggerStatus,
}

impl LayerTrigger {
    pub fn new(z_min: Option<f64>, height_increment: Option<f64>, require_zhop: bool, gate: ExtruderGate) -> Self {
        Self {
            z_min,
            height_increment: height_increment.filter(|inc| *inc > 0.0),
            require_zhop,
            gate,
            next_height: None,
            status: TriggerStatus::default(),
        }
    }

    pub fn update(&mut self, position: &PositionState) {
        if !position_ready(position) {
            self.status.is_triggered = false;
            return;
        }
        let primary = position.is_layer_change && self.crossed_threshold(position.height);
        let gate = gate_open(&self.gate, position) && (!self.require_zhop || position.is_zhop);
        self.status.resolve(primary, gate);
    }

    fn crossed_threshold(&mut self, height: f64) -> bool {
        if self.z_min.is_some_and(|z_min| height < z_min - EXTRUSION_EPSILON) {
            return false;
        }
        let Some(increment) = self.height_increment else {
            return true;
        };
        if self.next_height.is_some_and(|next| height < next - EXTRUSION_EPSILON) {
            return false;
        }
        // Several thresholds crossed at once still produce one snapshot.
        let steps = ((height + EXTRUSION_EPSILON) / increment).floor() + 1.0;
        self.next_height = Some(steps * increment);
        true
    }

    pub fn status(&self) -> TriggerStatus {
        self.status
    }

    pub fn clear(&mut self) {
        self.status.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;
    use lapse_shared::config::PrinterConfig;

    fn print_layers(trigger: &mut LayerTrigger, heights: &[f64]) -> Vec<f64> {
        let mut position = Position::new(&PrinterConfig::default());
        position.update("G28");
        position.update("M83");
        let mut fired = Vec::new();
        for z in heights {
            for cmd in [format!("G1 Z{}", z), "G1 X10 E0.5".to_string(), "G1 X20 E0.5".to_string()] {
                position.update(&cmd);
                trigger.update(position.state());
                if trigger.status().is_triggered {
                    fired.push(*z);
                    trigger.clear();
                }
            }
        }
        fired
    }

    #[test]
    fn test_fires_once_per_layer_after_z_min() {
        let mut trigger = LayerTrigger::new(Some(0.4), None, false, ExtruderGate::default());
        let fired = print_layers(&mut trigger, &[0.2, 0.4, 0.6, 0.8]);
        assert_eq!(fired, vec![0.4, 0.6, 0.8]);
    }

    #[test]
    fn test_height_increment() {
        let mut trigger = LayerTrigger::new(None, Some(1.0), false, ExtruderGate::default());
        let fired = print_layers(&mut trigger, &[0.2, 0.6, 1.0, 1.4, 1.8, 2.6, 3.0]);
        assert_eq!(fired, vec![0.2, 1.0, 2.6, 3.0]);
    }

    #[test]
    fn test_require_zhop_waits_for_hop() {
        let mut position = Position::new(&PrinterConfig::default());
        position.update("G28");
        position.update("M83");
        let mut trigger = LayerTrigger::new(None, None, true, ExtruderGate::default());

        position.update("G1 Z0.2");
        position.update("G1 X10 E0.5");
        trigger.update(position.state());
        assert!(trigger.status().is_waiting);

        position.update("G1 X20 E0.5");
        trigger.update(position.state());
        assert!(trigger.status().is_waiting);

        position.update("G1 Z0.7");
        trigger.update(position.state());
        assert!(trigger.status().is_triggered);
    }
}
