// src/stabilization.rs - Resolves where the toolhead parks for each snapshot
//
// Path strategies keep their index across snapshots of one print, so a
// sequence of parking spots can be walked, looped or ping-ponged.

use lapse_shared::config::{Axis, AxisStabilization, Bounds, StabilizationConfig};

use crate::snapshot_plan::PlanError;

#[derive(Debug, Clone)]
struct AxisResolver {
    axis: Axis,
    strategy: AxisStabilization,
    index: usize,
    forward: bool,
    started: bool,
}

impl AxisResolver {
    fn new(axis: Axis, strategy: AxisStabilization) -> Self {
        Self {
            axis,
            strategy,
            index: 0,
            forward: true,
            started: false,
        }
    }

    fn next_index(&mut self, len: usize, loop_path: bool, invert_loop: bool) -> usize {
        if !self.started {
            self.started = true;
            self.index = 0;
            return 0;
        }
        if len <= 1 {
            return 0;
        }
        self.index = if loop_path && invert_loop {
            if self.forward && self.index + 1 >= len {
                self.forward = false;
            } else if !self.forward && self.index == 0 {
                self.forward = true;
            }
            if self.forward { self.index + 1 } else { self.index - 1 }
        } else if loop_path {
            (self.index + 1) % len
        } else {
            (self.index + 1).min(len - 1)
        };
        self.index
    }

    fn resolve(&mut self, current: Option<f64>, bounds: &Bounds) -> Result<f64, PlanError> {
        let (min, max) = bounds.range(self.axis);
        let relative = |percent: f64| min + (max - min) * percent / 100.0;
        let value = match self.strategy.clone() {
            AxisStabilization::Disabled => current.ok_or(PlanError::UnknownPosition)?,
            AxisStabilization::Fixed { coordinate } => coordinate,
            AxisStabilization::Relative { percent } => relative(percent),
            AxisStabilization::FixedPath { path, loop_path, invert_loop } => {
                if path.is_empty() {
                    return Err(PlanError::EmptyPath { axis: self.axis });
                }
                path[self.next_index(path.len(), loop_path, invert_loop)]
            }
            AxisStabilization::RelativePath { path, loop_path, invert_loop } => {
                if path.is_empty() {
                    return Err(PlanError::EmptyPath { axis: self.axis });
                }
                relative(path[self.next_index(path.len(), loop_path, invert_loop)])
            }
        };
        if !bounds.contains(self.axis, value) {
            return Err(PlanError::OutOfBounds { axis: self.axis, value });
        }
        Ok(value)
    }
}

/// Per-print stabilization state for the X and Y axes.
#[derive(Debug, Clone)]
pub struct Stabilization {
    x: AxisResolver,
    y: AxisResolver,
    bounds: Bounds,
}

impl Stabilization {
    pub fn new(config: &StabilizationConfig, bounds: Bounds) -> Self {
        Self {
            x: AxisResolver::new(Axis::X, config.x.clone()),
            y: AxisResolver::new(Axis::Y, config.y.clone()),
            bounds,
        }
    }

    /// Parking coordinates for the next snapshot. Disabled axes keep the
    /// current coordinate. Path indexes only advance when both axes resolve.
    pub fn next_target(&mut self, current_x: Option<f64>, current_y: Option<f64>) -> Result<(f64, f64), PlanError> {
        let mut x_axis = self.x.clone();
        let mut y_axis = self.y.clone();
        let x = x_axis.resolve(current_x, &self.bounds)?;
        let y = y_axis.resolve(current_y, &self.bounds)?;
        self.x = x_axis;
        self.y = y_axis;
        Ok((x, y))
    }
}
