// lapse-rs: snapshot orchestration for 3D print timelapses.
//
// The coordinator sits between a print host and the printer, watches every
// outgoing command and, when a trigger fires, parks the toolhead for a photo
// and puts it back without the print noticing.

pub mod camera;
pub mod coordinator;
pub mod events;
pub mod extruder;
pub mod host;
pub mod position;
pub mod print_job;
pub mod printer;
pub mod simulator;
pub mod snapshot_plan;
pub mod stabilization;
pub mod trigger;

pub use coordinator::{CaptureOutcome, QueueDecision, TimelapseCoordinator, TimelapseState};
pub use events::TimelapseEvent;
pub use lapse_shared::config::{LapseConfig, load_config};
pub use printer::{EchoReason, PrinterControl};
