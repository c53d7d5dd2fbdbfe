// Snapshot protocol scenarios driven through the coordinator hooks

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use lapse_rs::camera::{CameraError, CaptureRequest, SnapshotCapture};
use lapse_rs::print_job::PrintEndReason;
use lapse_rs::simulator::PrinterAction;
use lapse_rs::{EchoReason, PrinterControl, QueueDecision, TimelapseCoordinator, TimelapseEvent, TimelapseState};
use lapse_shared::ManualClock;
use lapse_shared::TimeInterface;
use lapse_shared::config::{AxisStabilization, LapseConfig, TriggerConfig, TriggerKind};
use tokio::sync::mpsc;

#[derive(Default)]
struct RecordingPrinter {
    log: Mutex<Vec<PrinterAction>>,
}

impl RecordingPrinter {
    fn take(&self) -> Vec<PrinterAction> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}

impl PrinterControl for RecordingPrinter {
    fn pause_print(&self) {
        self.log.lock().unwrap().push(PrinterAction::Pause);
    }
    fn resume_print(&self) {
        self.log.lock().unwrap().push(PrinterAction::Resume);
    }
    fn send_commands(&self, commands: &[String]) {
        self.log.lock().unwrap().push(PrinterAction::Send(commands.to_vec()));
    }
    fn request_position_echo(&self, reason: EchoReason) {
        self.log.lock().unwrap().push(PrinterAction::RequestPosition(reason));
    }
}

struct FakeCamera {
    fail: bool,
}

#[async_trait]
impl SnapshotCapture for FakeCamera {
    async fn capture(&self, request: CaptureRequest) -> Result<PathBuf, CameraError> {
        if self.fail {
            Err(CameraError::Status(503))
        } else {
            Ok(request.output_path(Local::now()))
        }
    }
}

struct Harness {
    coordinator: TimelapseCoordinator,
    printer: Arc<RecordingPrinter>,
    events: mpsc::UnboundedReceiver<TimelapseEvent>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(config: LapseConfig, camera_fails: bool) -> Self {
        let printer = Arc::new(RecordingPrinter::default());
        let clock = Arc::new(ManualClock::new());
        let (tx, events) = mpsc::unbounded_channel();
        let coordinator = TimelapseCoordinator::new(config, printer.clone(), tx)
            .with_clock(clock.clone())
            .with_camera(Arc::new(FakeCamera { fail: camera_fails }));
        Self { coordinator, printer, events, clock }
    }

    fn queue_all(&mut self, commands: &[&str]) {
        for cmd in commands {
            assert_eq!(self.coordinator.on_command_queuing(cmd), QueueDecision::Pass, "{}", cmd);
            self.coordinator.on_command_sent(cmd);
        }
    }

    /// Plays the last command batch sent by the coordinator back through
    /// the hooks, as a host would.
    fn deliver_batch(&mut self) -> Vec<String> {
        let batch = self
            .printer
            .take()
            .into_iter()
            .rev()
            .find_map(|a| match a {
                PrinterAction::Send(commands) => Some(commands),
                _ => None,
            })
            .expect("no command batch was sent");
        for cmd in &batch {
            assert_eq!(self.coordinator.on_command_queuing(cmd), QueueDecision::Pass, "{}", cmd);
            self.coordinator.on_command_sent(cmd);
        }
        batch
    }

    fn echo(&mut self, x: f64, y: f64, z: f64, reason: EchoReason) -> bool {
        self.coordinator.on_position_received(x, y, z, None, Some(reason)).0
    }

    fn drain_events(&mut self) -> Vec<TimelapseEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn fixed_origin_config() -> LapseConfig {
    let mut config = LapseConfig::default();
    config.stabilization.x = AxisStabilization::Fixed { coordinate: 0.0 };
    config.stabilization.y = AxisStabilization::Fixed { coordinate: 0.0 };
    config
}

fn start_and_fire(h: &mut Harness) {
    h.coordinator.on_print_start("cube.gcode");
    h.queue_all(&["G28", "G90", "M82", "G1 X10 Y10 Z0.2 F1800"]);
    assert_eq!(h.coordinator.on_command_queuing("@SNAPSHOT"), QueueDecision::Suppress);
    assert_eq!(h.coordinator.state(), TimelapseState::RequestingReturnPosition);
    assert_eq!(
        h.printer.take(),
        vec![PrinterAction::Pause, PrinterAction::RequestPosition(EchoReason::ReturnPosition)]
    );
}

#[tokio::test]
async fn test_full_snapshot_cycle_restores_printer() {
    let mut h = Harness::new(fixed_origin_config(), false);
    start_and_fire(&mut h);

    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::ReturnPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::SendingSnapshotGcode);
    let parking = h.deliver_batch();
    assert_eq!(parking[5], "G1 X0.000 Y0.000 F6000");
    assert_eq!(h.coordinator.state(), TimelapseState::TakingSnapshot);
    assert_eq!(h.printer.take(), vec![PrinterAction::RequestPosition(EchoReason::SnapshotPosition)]);

    assert!(h.echo(0.0, 0.0, 0.7, EchoReason::SnapshotPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::SendingReturnGcode);
    let ret = h.deliver_batch();
    assert_eq!(ret.first().map(String::as_str), Some("G1 X10.000 Y10.000 F6000"));
    assert!(!ret.iter().any(|c| c == "@SNAPSHOT"));
    assert_eq!(h.printer.take(), vec![PrinterAction::RequestPosition(EchoReason::RestoredPosition)]);

    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::RestoredPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingForTrigger);
    assert_eq!(h.printer.take(), vec![PrinterAction::Resume]);

    assert!(h.coordinator.wait_for_capture().await);
    let events = h.drain_events();
    let names: Vec<&str> = events.iter().map(TimelapseEvent::name).collect();
    assert_eq!(names, vec!["print_started", "snapshot_start", "snapshot_complete"]);
    match &events[2] {
        TimelapseEvent::SnapshotComplete { success, snapshot_count, .. } => {
            assert!(*success);
            assert_eq!(*snapshot_count, 1);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let state = h.coordinator.position().state();
    assert_eq!(state.x, Some(10.0));
    assert_eq!(state.y, Some(10.0));
    assert!((state.z.unwrap() - 0.2).abs() < 1e-9);
    assert_eq!(state.f, Some(1800.0));
    assert!(!state.is_relative);
    assert!(!state.is_extruder_relative);
    assert!(state.extruder().retraction_length.abs() < 1e-9);
}

#[tokio::test]
async fn test_position_retries_exhausted_then_proceeds() {
    let mut config = fixed_origin_config();
    config.snapshot.position_tolerance = 0.005;
    config.snapshot.position_retries = 3;
    let mut h = Harness::new(config, false);
    start_and_fire(&mut h);
    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::ReturnPosition));
    h.deliver_batch();
    assert_eq!(h.printer.take(), vec![PrinterAction::RequestPosition(EchoReason::SnapshotPosition)]);

    for _ in 0..3 {
        assert!(!h.echo(0.01, 0.0, 0.7, EchoReason::SnapshotPosition));
        assert_eq!(h.coordinator.state(), TimelapseState::TakingSnapshot);
        assert_eq!(h.printer.take(), vec![PrinterAction::RequestPosition(EchoReason::SnapshotPosition)]);
    }
    assert!(h.echo(0.01, 0.0, 0.7, EchoReason::SnapshotPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::SendingReturnGcode);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, TimelapseEvent::PositionError { .. })));

    h.deliver_batch();
    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::RestoredPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingForTrigger);
}

#[tokio::test]
async fn test_cancel_during_parking_finishes_protocol_first() {
    let mut h = Harness::new(fixed_origin_config(), false);
    start_and_fire(&mut h);
    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::ReturnPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::SendingSnapshotGcode);

    h.coordinator.on_print_end(PrintEndReason::Cancelled);
    assert_eq!(h.coordinator.state(), TimelapseState::SendingSnapshotGcode);

    h.deliver_batch();
    assert!(h.echo(0.0, 0.0, 0.7, EchoReason::SnapshotPosition));
    h.deliver_batch();
    h.printer.take();
    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::RestoredPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingToRender);
    assert_eq!(h.printer.take(), vec![PrinterAction::Resume]);

    assert!(h.coordinator.wait_for_capture().await);
    let events = h.drain_events();
    let names: Vec<&str> = events.iter().map(TimelapseEvent::name).collect();
    assert_eq!(names.last(), Some(&"render_ready"));
    assert!(events.iter().any(|e| matches!(
        e,
        TimelapseEvent::RenderReady { reason: PrintEndReason::Cancelled, snapshot_count: 1, .. }
    )));
}

#[tokio::test]
async fn test_cancel_before_parking_skips_snapshot() {
    let mut h = Harness::new(fixed_origin_config(), false);
    start_and_fire(&mut h);
    h.coordinator.on_print_end(PrintEndReason::Cancelled);

    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::ReturnPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingToRender);
    assert_eq!(h.printer.take(), vec![PrinterAction::Resume]);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, TimelapseEvent::SnapshotComplete { success: false, .. })));
    assert!(matches!(events.last(), Some(TimelapseEvent::RenderReady { snapshot_count: 0, .. })));
}

#[tokio::test]
async fn test_plan_failure_resumes_and_replays_trigger_command() {
    let mut config = LapseConfig::default();
    config.stabilization.x = AxisStabilization::Fixed { coordinate: -50.0 };
    config.triggers = vec![TriggerConfig::new(TriggerKind::Layer {
        z_min: None,
        height_increment: None,
        require_zhop: false,
    })];
    let mut h = Harness::new(config, false);
    h.coordinator.on_print_start("cube.gcode");
    h.queue_all(&["G28", "M83", "G1 Z0.2"]);
    assert_eq!(h.coordinator.on_command_queuing("G1 X10 Y10 E1"), QueueDecision::Suppress);
    h.printer.take();

    assert!(h.echo(0.0, 0.0, 0.2, EchoReason::ReturnPosition));
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingForTrigger);
    assert_eq!(
        h.printer.take(),
        vec![PrinterAction::Send(vec!["G1 X10 Y10 E1".to_string()]), PrinterAction::Resume]
    );

    assert_eq!(h.coordinator.on_command_queuing("G1 X10 Y10 E1"), QueueDecision::Pass);
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingForTrigger);
    assert_eq!(h.coordinator.position().state().layer, 1);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        TimelapseEvent::SnapshotComplete { success: false, error: Some(msg), .. } if msg.contains("outside")
    )));
}

#[tokio::test]
async fn test_timer_replays_move_after_restore_is_confirmed() {
    let mut config = fixed_origin_config();
    config.triggers = vec![TriggerConfig::new(TriggerKind::Timer { interval_seconds: 5.0 })];
    let mut h = Harness::new(config, false);
    h.coordinator.on_print_start("cube.gcode");
    h.queue_all(&["G28", "G90", "M82", "G1 X10 Y10 Z0.2 F1800"]);
    h.clock.advance(Duration::from_secs(6));
    assert_eq!(h.coordinator.on_command_queuing("G1 X50 Y50"), QueueDecision::Suppress);
    h.printer.take();

    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::ReturnPosition));
    h.deliver_batch();
    assert!(h.echo(0.0, 0.0, 0.7, EchoReason::SnapshotPosition));
    let ret = h.deliver_batch();
    assert_eq!(ret.first().map(String::as_str), Some("G1 X10.000 Y10.000 F6000"));
    assert!(!ret.iter().any(|c| c == "G1 X50 Y50"));
    assert_eq!(h.printer.take(), vec![PrinterAction::RequestPosition(EchoReason::RestoredPosition)]);

    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::RestoredPosition));
    let saved = h.coordinator.position().saved_position().unwrap();
    assert_eq!((saved.x, saved.y), (Some(10.0), Some(10.0)));
    assert_eq!(
        h.printer.take(),
        vec![PrinterAction::Send(vec!["G1 X50 Y50".to_string()]), PrinterAction::Resume]
    );
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingForTrigger);

    assert_eq!(h.coordinator.on_command_queuing("G1 X50 Y50"), QueueDecision::Pass);
    h.coordinator.on_command_sent("G1 X50 Y50");
    assert_eq!(h.coordinator.position().state().x, Some(50.0));
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingForTrigger);
}

#[tokio::test]
async fn test_out_of_plan_commands_are_suppressed() {
    let mut h = Harness::new(fixed_origin_config(), false);
    start_and_fire(&mut h);
    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::ReturnPosition));

    let batch = match h.printer.take().pop() {
        Some(PrinterAction::Send(commands)) => commands,
        other => panic!("expected a command batch, got {:?}", other),
    };
    assert_eq!(h.coordinator.on_command_queuing("M105"), QueueDecision::Suppress);
    assert_eq!(h.coordinator.on_command_queuing(&batch[1]), QueueDecision::Suppress);
    assert_eq!(h.coordinator.on_command_queuing(&batch[0]), QueueDecision::Pass);
    assert_eq!(h.coordinator.state(), TimelapseState::SendingSnapshotGcode);
}

#[tokio::test]
async fn test_return_position_timeout_resumes_print() {
    let mut h = Harness::new(fixed_origin_config(), false);
    start_and_fire(&mut h);

    h.clock.advance(Duration::from_secs(5));
    h.coordinator.on_tick(h.clock.now_monotonic());
    assert_eq!(h.coordinator.state(), TimelapseState::RequestingReturnPosition);

    h.clock.advance(Duration::from_secs(6));
    h.coordinator.on_tick(h.clock.now_monotonic());
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingForTrigger);
    assert_eq!(h.printer.take(), vec![PrinterAction::Resume]);

    let (accepted, _) = h.coordinator.on_position_received(10.0, 10.0, 0.2, None, None);
    assert!(!accepted);
}

#[tokio::test]
async fn test_capture_failure_still_resumes() {
    let mut h = Harness::new(fixed_origin_config(), true);
    start_and_fire(&mut h);
    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::ReturnPosition));
    h.deliver_batch();
    assert!(h.echo(0.0, 0.0, 0.7, EchoReason::SnapshotPosition));
    h.deliver_batch();
    assert!(h.echo(10.0, 10.0, 0.2, EchoReason::RestoredPosition));
    assert!(h.coordinator.wait_for_capture().await);

    assert_eq!(h.coordinator.state(), TimelapseState::WaitingForTrigger);
    assert_eq!(h.coordinator.job().map(|j| j.failed_snapshot_count), Some(1));
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, TimelapseEvent::SnapshotComplete { success: false, .. })));
}

#[tokio::test]
async fn test_staged_config_applies_at_next_print() {
    let mut h = Harness::new(fixed_origin_config(), false);
    h.coordinator.on_print_start("cube.gcode");
    let mut next = fixed_origin_config();
    next.printer.snapshot_command = "@TAKE".to_string();
    h.coordinator.stage_config(next);
    assert_eq!(h.coordinator.config().printer.snapshot_command, "@SNAPSHOT");

    h.coordinator.on_print_end(PrintEndReason::Completed);
    assert_eq!(h.coordinator.state(), TimelapseState::WaitingToRender);
    h.coordinator.on_print_start("cube.gcode");
    assert_eq!(h.coordinator.config().printer.snapshot_command, "@TAKE");
}
