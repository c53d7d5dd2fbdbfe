// src/coordinator.rs - Timelapse state machine
//
// Owns the position tracker and trigger engine for one print. The host calls
// the `on_*` hooks from its command thread; none of them block. Captures run
// on the tokio runtime and report back through a bounded channel.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use lapse_shared::config::LapseConfig;
use lapse_shared::gcode::{ParsedCommand, normalize_command};
use lapse_shared::{SystemClock, TimeInterface};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::camera::{CaptureRequest, SnapshotCapture};
use crate::events::TimelapseEvent;
use crate::position::Position;
use crate::print_job::{PrintEndReason, PrintJob};
use crate::printer::{EchoReason, PrinterControl};
use crate::snapshot_plan::{SnapshotPlan, SnapshotPlanner};
use crate::stabilization::Stabilization;
use crate::trigger::{Trigger, Triggers};

const CAPTURE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelapseState {
    Idle,
    WaitingForTrigger,
    RequestingReturnPosition,
    SendingSnapshotGcode,
    TakingSnapshot,
    SendingReturnGcode,
    WaitingToRender,
}

impl TimelapseState {
    /// Whether a snapshot protocol is running and the print is paused.
    pub fn is_taking_snapshot(&self) -> bool {
        matches!(
            self,
            TimelapseState::RequestingReturnPosition
                | TimelapseState::SendingSnapshotGcode
                | TimelapseState::TakingSnapshot
                | TimelapseState::SendingReturnGcode
        )
    }
}

/// What the host should do with a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDecision {
    Pass,
    Suppress,
}

/// Result of one capture, delivered from the capture task.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub sequence: u32,
    pub result: Result<PathBuf, String>,
}

/// In-flight snapshot protocol data.
#[derive(Debug)]
struct SnapshotProtocol {
    sequence: u32,
    replay: Option<String>,
    plan: Option<SnapshotPlan>,
    /// Confirmed commands of the batch currently being sent.
    sent: usize,
    awaiting_echo: Option<EchoReason>,
    deadline: Instant,
    mismatches: u32,
    paused_at: Instant,
}

/// A snapshot whose completion event has not been emitted yet.
#[derive(Debug)]
struct PendingSnapshot {
    sequence: u32,
    capture: Option<Result<PathBuf, String>>,
    seconds_added: Option<f64>,
}

pub struct TimelapseCoordinator {
    config: Arc<LapseConfig>,
    staged_config: Option<Arc<LapseConfig>>,
    clock: Arc<dyn TimeInterface>,
    printer: Arc<dyn PrinterControl>,
    camera: Option<Arc<dyn SnapshotCapture>>,
    events: mpsc::UnboundedSender<TimelapseEvent>,
    capture_tx: mpsc::Sender<CaptureOutcome>,
    capture_rx: Option<mpsc::Receiver<CaptureOutcome>>,
    state: TimelapseState,
    position: Position,
    triggers: Triggers,
    planner: SnapshotPlanner,
    snapshot_token: String,
    /// Commands the coordinator sent, in the order the host will queue them.
    injected: VecDeque<String>,
    job: Option<PrintJob>,
    protocol: Option<SnapshotProtocol>,
    pending: VecDeque<PendingSnapshot>,
    pending_end: Option<PrintEndReason>,
    pending_render: Option<PrintEndReason>,
}

impl TimelapseCoordinator {
    pub fn new(
        config: LapseConfig,
        printer: Arc<dyn PrinterControl>,
        events: mpsc::UnboundedSender<TimelapseEvent>,
    ) -> Self {
        let config = Arc::new(config);
        let clock: Arc<dyn TimeInterface> = Arc::new(SystemClock);
        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (position, triggers, planner, snapshot_token) = build_components(&config, clock.clone());
        Self {
            config,
            staged_config: None,
            clock,
            printer,
            camera: None,
            events,
            capture_tx,
            capture_rx: Some(capture_rx),
            state: TimelapseState::Idle,
            position,
            triggers,
            planner,
            snapshot_token,
            injected: VecDeque::new(),
            job: None,
            protocol: None,
            pending: VecDeque::new(),
            pending_end: None,
            pending_render: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeInterface>) -> Self {
        self.clock = clock;
        self.rebuild();
        self
    }

    pub fn with_camera(mut self, camera: Arc<dyn SnapshotCapture>) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Hands the capture result receiver to a host loop that wants to
    /// `select!` on it. Results must then be fed back via
    /// [`on_capture_result`](Self::on_capture_result).
    pub fn take_capture_receiver(&mut self) -> Option<mpsc::Receiver<CaptureOutcome>> {
        self.capture_rx.take()
    }

    pub fn state(&self) -> TimelapseState {
        self.state
    }

    pub fn config(&self) -> &LapseConfig {
        &self.config
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    pub fn job(&self) -> Option<&PrintJob> {
        self.job.as_ref()
    }

    pub fn clock(&self) -> Arc<dyn TimeInterface> {
        self.clock.clone()
    }

    /// Replaces the configuration. Applied now when no print is being
    /// recorded, otherwise at the next print start.
    pub fn stage_config(&mut self, config: LapseConfig) {
        let config = Arc::new(config);
        if matches!(self.state, TimelapseState::Idle | TimelapseState::WaitingToRender) {
            info!("Applying new timelapse configuration");
            self.config = config;
            self.rebuild();
        } else {
            info!("Timelapse configuration staged for the next print");
            self.staged_config = Some(config);
        }
    }

    fn rebuild(&mut self) {
        let (position, triggers, planner, snapshot_token) = build_components(&self.config, self.clock.clone());
        self.position = position;
        self.triggers = triggers;
        self.planner = planner;
        self.snapshot_token = snapshot_token;
    }

    fn set_state(&mut self, state: TimelapseState) {
        if self.state != state {
            debug!("Timelapse state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn emit(&self, event: TimelapseEvent) {
        if self.events.send(event).is_err() {
            debug!("Timelapse event receiver dropped");
        }
    }

    fn position_timeout(&self) -> Duration {
        Duration::from_millis(self.config.snapshot.position_timeout_ms)
    }

    pub fn on_print_start(&mut self, print_file: &str) {
        self.process_capture_results();
        if self.state.is_taking_snapshot() {
            warn!("Print started during {:?}; discarding the snapshot in progress", self.state);
        }
        self.protocol = None;
        if let Some(staged) = self.staged_config.take() {
            info!("Applying staged timelapse configuration");
            self.config = staged;
        }
        self.rebuild();
        self.injected.clear();
        self.pending.clear();
        self.pending_end = None;
        self.pending_render = None;

        let job = PrintJob::new(print_file);
        self.emit(TimelapseEvent::PrintStarted {
            job_id: job.id,
            print_file: job.print_file.clone(),
        });
        self.job = Some(job);
        self.set_state(TimelapseState::WaitingForTrigger);
    }

    /// User or host initiated pause, not one issued by the coordinator.
    pub fn on_print_paused(&mut self) {
        if self.state == TimelapseState::WaitingForTrigger {
            self.triggers.pause();
        }
    }

    pub fn on_print_resumed(&mut self) {
        if self.state == TimelapseState::WaitingForTrigger {
            self.triggers.resume();
        }
    }

    pub fn on_print_end(&mut self, reason: PrintEndReason) {
        self.process_capture_results();
        match self.state {
            TimelapseState::Idle | TimelapseState::WaitingToRender => {
                debug!("Print end ({:?}) with no timelapse in progress", reason);
            }
            TimelapseState::WaitingForTrigger => self.complete_print(reason),
            state => {
                info!("Print ended ({:?}) during {:?}; finishing once the printer is restored", reason, state);
                self.pending_end = Some(reason);
            }
        }
    }

    fn complete_print(&mut self, reason: PrintEndReason) {
        self.set_state(TimelapseState::WaitingToRender);
        if self.pending.is_empty() {
            self.emit_render_ready(reason);
        } else {
            debug!("Waiting for {} capture(s) before rendering", self.pending.len());
            self.pending_render = Some(reason);
        }
    }

    fn emit_render_ready(&mut self, reason: PrintEndReason) {
        let Some(job) = &self.job else {
            return;
        };
        info!(
            "Timelapse for {} ready to render: {} snapshot(s), {} failed",
            job.print_file, job.snapshot_count, job.failed_snapshot_count
        );
        self.emit(TimelapseEvent::RenderReady {
            job_id: job.id,
            print_file: job.print_file.clone(),
            start_time: job.start_time,
            end_time: Local::now(),
            snapshot_count: job.snapshot_count,
            reason,
        });
    }

    /// Returns to `Idle` once rendering has been handed off.
    pub fn reset(&mut self) {
        self.protocol = None;
        self.injected.clear();
        self.pending.clear();
        self.pending_end = None;
        self.pending_render = None;
        self.job = None;
        self.rebuild();
        self.set_state(TimelapseState::Idle);
    }

    /// Called for every command before the host queues it to the printer.
    pub fn on_command_queuing(&mut self, raw: &str) -> QueueDecision {
        self.process_capture_results();
        let command = raw.trim();

        if self.injected.front().is_some_and(|c| c == command) {
            self.injected.pop_front();
            self.position.update(command);
            return QueueDecision::Pass;
        }

        match self.state {
            TimelapseState::Idle | TimelapseState::WaitingToRender => {
                if normalize_command(command) == self.snapshot_token {
                    return QueueDecision::Suppress;
                }
                self.position.update(command);
                QueueDecision::Pass
            }
            TimelapseState::WaitingForTrigger => self.queue_while_armed(command),
            state => {
                warn!("Suppressing out-of-plan command '{}' during {:?}", command, state);
                QueueDecision::Suppress
            }
        }
    }

    fn queue_while_armed(&mut self, command: &str) -> QueueDecision {
        self.position.update(command);
        self.triggers.update(self.position.state(), command);
        let is_token = normalize_command(command) == self.snapshot_token;

        let Some(trigger) = self.triggers.first_triggering().map(Trigger::name) else {
            if is_token {
                debug!("Snapshot command did not trigger; suppressing it");
                return QueueDecision::Suppress;
            }
            return QueueDecision::Pass;
        };

        self.triggers.reset();
        self.position.undo_update();
        self.position.save_position();
        let replay = if is_token || self.is_suppressed(command) {
            None
        } else {
            Some(command.to_string())
        };
        self.begin_snapshot(trigger, replay);
        QueueDecision::Suppress
    }

    fn is_suppressed(&self, command: &str) -> bool {
        let token = ParsedCommand::parse(command).ok().map(|c| c.command);
        let normalized = normalize_command(command);
        self.config.snapshot.suppressed_commands.iter().any(|s| {
            let s = normalize_command(s);
            token.as_deref() == Some(s.as_str()) || s == normalized
        })
    }

    fn begin_snapshot(&mut self, trigger: &str, replay: Option<String>) {
        let now = self.clock.now_monotonic();
        let sequence = self.job.as_mut().map(PrintJob::next_sequence).unwrap_or(0);
        info!("Snapshot {} triggered by {} trigger", sequence, trigger);
        self.emit(TimelapseEvent::SnapshotStart {
            sequence,
            trigger: trigger.to_string(),
        });
        self.protocol = Some(SnapshotProtocol {
            sequence,
            replay,
            plan: None,
            sent: 0,
            awaiting_echo: None,
            deadline: now + self.position_timeout(),
            mismatches: 0,
            paused_at: now,
        });
        self.pending.push_back(PendingSnapshot {
            sequence,
            capture: None,
            seconds_added: None,
        });
        self.set_state(TimelapseState::RequestingReturnPosition);
        self.printer.pause_print();
        self.request_echo(EchoReason::ReturnPosition);
    }

    fn request_echo(&mut self, reason: EchoReason) {
        let deadline = self.clock.now_monotonic() + self.position_timeout();
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.awaiting_echo = Some(reason);
            protocol.deadline = deadline;
        }
        self.printer.request_position_echo(reason);
    }

    fn send_commands(&mut self, commands: Vec<String>) {
        let deadline = self.clock.now_monotonic() + self.position_timeout();
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.sent = 0;
            protocol.deadline = deadline;
        }
        self.injected.extend(commands.iter().cloned());
        self.printer.send_commands(&commands);
    }

    /// Called once the host has written a command to the printer.
    pub fn on_command_sent(&mut self, raw: &str) {
        self.process_capture_results();
        let command = raw.trim();
        let state = self.state;
        let Some(protocol) = self.protocol.as_mut() else {
            return;
        };
        if protocol.awaiting_echo.is_some() {
            return;
        }
        let Some(plan) = protocol.plan.as_ref() else {
            return;
        };
        let batch = match state {
            TimelapseState::SendingSnapshotGcode => &plan.snapshot_commands,
            TimelapseState::SendingReturnGcode => plan.restore_commands(),
            _ => return,
        };
        if batch.get(protocol.sent).is_none_or(|expected| expected != command) {
            debug!("Sent command '{}' is not the next planned command", command);
            return;
        }
        protocol.sent += 1;
        if protocol.sent < batch.len() {
            return;
        }
        match state {
            TimelapseState::SendingSnapshotGcode => {
                self.set_state(TimelapseState::TakingSnapshot);
                self.request_echo(EchoReason::SnapshotPosition);
            }
            _ => self.request_echo(EchoReason::RestoredPosition),
        }
    }

    /// Position report from the printer. Returns whether the report was
    /// accepted and a short description for the host log.
    pub fn on_position_received(
        &mut self,
        x: f64,
        y: f64,
        z: f64,
        e: Option<f64>,
        reason: Option<EchoReason>,
    ) -> (bool, String) {
        self.process_capture_results();
        let Some(expected) = self.protocol.as_ref().and_then(|p| p.awaiting_echo) else {
            return (false, "No position report was requested".to_string());
        };
        if let Some(reason) = reason.filter(|r| *r != expected) {
            return (false, format!("Expected {:?} report, got {:?}", expected, reason));
        }
        debug!("Position report ({:?}): X{:.3} Y{:.3} Z{:.3} E{:?}", expected, x, y, z, e);
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.awaiting_echo = None;
        }
        match expected {
            EchoReason::ReturnPosition => self.handle_return_position(x, y, z),
            EchoReason::SnapshotPosition => self.handle_snapshot_position(x, y, z),
            EchoReason::RestoredPosition => self.handle_restored_position(x, y, z),
        }
    }

    fn adopt_if_mismatched(&mut self, x: f64, y: f64, z: f64, what: &str) {
        let tolerance = self.config.snapshot.position_tolerance;
        if self.position.is_at_saved_position(x, y, z, tolerance) {
            return;
        }
        let expected = self
            .position
            .saved_position()
            .map(|s| format!("{:?}/{:?}/{:?}", s.x, s.y, s.z))
            .unwrap_or_else(|| "unknown".to_string());
        warn!(
            "{} mismatch: printer reported X{:.3} Y{:.3} Z{:.3}, expected {}; adopting printer position",
            what, x, y, z, expected
        );
        self.position.set_from_echo(x, y, z);
        self.position.save_position();
    }

    fn handle_return_position(&mut self, x: f64, y: f64, z: f64) -> (bool, String) {
        self.adopt_if_mismatched(x, y, z, "Return position");

        if let Some(reason) = self.pending_end {
            info!("Print ended ({:?}) before parking; skipping snapshot", reason);
            self.abort_protocol("Print ended before the snapshot".to_string(), false);
            return (true, "Print ended; snapshot skipped".to_string());
        }

        let replay = self.protocol.as_ref().and_then(|p| p.replay.clone());
        match self.planner.create_plan(self.position.state(), replay.as_deref()) {
            Ok(plan) => {
                debug!("Parking with '{}'", plan.parking_move());
                let commands = plan.snapshot_commands.clone();
                if let Some(protocol) = self.protocol.as_mut() {
                    protocol.plan = Some(plan);
                }
                self.set_state(TimelapseState::SendingSnapshotGcode);
                self.send_commands(commands);
                (true, "Sending snapshot commands".to_string())
            }
            Err(e) => {
                warn!("Unable to plan snapshot: {}", e);
                let message = format!("Snapshot skipped: {}", e);
                self.abort_protocol(e.to_string(), true);
                (true, message)
            }
        }
    }

    fn handle_snapshot_position(&mut self, x: f64, y: f64, z: f64) -> (bool, String) {
        let tolerance = self.config.snapshot.position_tolerance;
        let Some((target_x, target_y)) = self
            .protocol
            .as_ref()
            .and_then(|p| p.plan.as_ref())
            .map(|plan| (plan.target_x, plan.target_y))
        else {
            return (false, "No snapshot plan".to_string());
        };
        let at_target = (x - target_x).abs() <= tolerance && (y - target_y).abs() <= tolerance;
        if !at_target {
            let detail = format!(
                "Snapshot position X{:.3} Y{:.3} differs from target X{:.3} Y{:.3}",
                x, y, target_x, target_y
            );
            if self.register_mismatch(detail) {
                return (false, "Snapshot position mismatch; retrying".to_string());
            }
        }
        self.position.set_from_echo(x, y, z);
        self.capture_and_return();
        (true, "Snapshot position confirmed".to_string())
    }

    /// Counts a failed snapshot position check. Returns true when another
    /// position report was requested.
    fn register_mismatch(&mut self, detail: String) -> bool {
        let retries = self.config.snapshot.position_retries;
        let Some(protocol) = self.protocol.as_mut() else {
            return false;
        };
        protocol.mismatches += 1;
        let attempt = protocol.mismatches;
        if attempt <= retries {
            warn!("{}; retrying ({}/{})", detail, attempt, retries);
            self.request_echo(EchoReason::SnapshotPosition);
            return true;
        }
        error!("{}; continuing after {} retries", detail, retries);
        self.emit(TimelapseEvent::PositionError { message: detail });
        false
    }

    fn capture_and_return(&mut self) {
        self.start_capture();
        let Some(commands) = self
            .protocol
            .as_ref()
            .and_then(|p| p.plan.as_ref())
            .map(|plan| plan.restore_commands().to_vec())
        else {
            return;
        };
        self.set_state(TimelapseState::SendingReturnGcode);
        self.send_commands(commands);
    }

    fn handle_restored_position(&mut self, x: f64, y: f64, z: f64) -> (bool, String) {
        self.adopt_if_mismatched(x, y, z, "Restored position");
        self.send_replay();
        self.finish_protocol();
        (true, "Printer restored".to_string())
    }

    /// Sends the commands planned after the restore batch.
    fn send_replay(&mut self) {
        let commands = self
            .protocol
            .as_ref()
            .and_then(|p| p.plan.as_ref())
            .map(|plan| plan.replay_commands().to_vec())
            .unwrap_or_default();
        if !commands.is_empty() {
            self.send_commands(commands);
        }
    }

    fn start_capture(&mut self) {
        let Some(sequence) = self.protocol.as_ref().map(|p| p.sequence) else {
            return;
        };
        let Some(camera) = self.camera.clone() else {
            self.apply_capture(CaptureOutcome {
                sequence,
                result: Err("No camera configured".to_string()),
            });
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.apply_capture(CaptureOutcome {
                    sequence,
                    result: Err(format!("No async runtime for capture: {}", e)),
                });
                return;
            }
        };
        let request = CaptureRequest {
            print_name: self.job.as_ref().map(|j| j.print_file.clone()).unwrap_or_default(),
            sequence,
            output_dir: PathBuf::from(&self.config.snapshot.output_dir),
            filename_template: self.config.snapshot.filename_template.clone(),
        };
        let tx = self.capture_tx.clone();
        handle.spawn(async move {
            let result = camera.capture(request).await.map_err(|e| e.to_string());
            if tx.send(CaptureOutcome { sequence, result }).await.is_err() {
                debug!("Capture result for snapshot {} dropped", sequence);
            }
        });
    }

    /// Sends the replayed command if needed, then resumes the print.
    fn abort_protocol(&mut self, error: String, replay: bool) {
        let Some(protocol) = self.protocol.as_mut() else {
            return;
        };
        let sequence = protocol.sequence;
        let replay_command = if replay { protocol.replay.take() } else { None };
        if let Some(command) = replay_command {
            self.send_commands(vec![command]);
        }
        self.apply_capture(CaptureOutcome { sequence, result: Err(error) });
        self.finish_protocol();
    }

    fn finish_protocol(&mut self) {
        let Some(protocol) = self.protocol.take() else {
            return;
        };
        self.printer.resume_print();
        let seconds_added = self
            .clock
            .now_monotonic()
            .saturating_duration_since(protocol.paused_at)
            .as_secs_f64();
        info!("Snapshot {} finished; print paused for {:.2}s", protocol.sequence, seconds_added);
        if let Some(pending) = self.pending.iter_mut().find(|p| p.sequence == protocol.sequence) {
            pending.seconds_added = Some(seconds_added);
        }
        self.set_state(TimelapseState::WaitingForTrigger);
        if let Some(reason) = self.pending_end.take() {
            self.complete_print(reason);
        }
        self.flush_pending();
    }

    /// Applies capture results that arrived on the internal channel.
    pub fn process_capture_results(&mut self) {
        let mut outcomes = Vec::new();
        if let Some(rx) = self.capture_rx.as_mut() {
            while let Ok(outcome) = rx.try_recv() {
                outcomes.push(outcome);
            }
        }
        for outcome in outcomes {
            self.on_capture_result(outcome);
        }
    }

    /// Waits for the next capture result on the internal channel and applies
    /// it. Returns false when the receiver was taken or closed.
    pub async fn wait_for_capture(&mut self) -> bool {
        let Some(rx) = self.capture_rx.as_mut() else {
            return false;
        };
        match rx.recv().await {
            Some(outcome) => {
                self.on_capture_result(outcome);
                true
            }
            None => false,
        }
    }

    pub fn on_capture_result(&mut self, outcome: CaptureOutcome) {
        self.apply_capture(outcome);
        self.flush_pending();
    }

    fn apply_capture(&mut self, outcome: CaptureOutcome) {
        let Some(pending) = self.pending.iter_mut().find(|p| p.sequence == outcome.sequence) else {
            debug!("Discarding capture result for snapshot {}", outcome.sequence);
            return;
        };
        match &outcome.result {
            Ok(path) => info!("Snapshot {} captured: {}", outcome.sequence, path.display()),
            Err(e) => warn!("Snapshot {} failed: {}", outcome.sequence, e),
        }
        let success = outcome.result.is_ok();
        pending.capture = Some(outcome.result);
        if let Some(job) = self.job.as_mut() {
            job.record_capture(success);
        }
    }

    fn flush_pending(&mut self) {
        while let Some(front) = self.pending.front() {
            if front.capture.is_none() || front.seconds_added.is_none() {
                break;
            }
            let Some(done) = self.pending.pop_front() else {
                break;
            };
            let snapshot_count = self.job.as_ref().map(|j| j.snapshot_count).unwrap_or(0);
            let (success, path, error) = match done.capture {
                Some(Ok(path)) => (true, Some(path), None),
                Some(Err(e)) => (false, None, Some(e)),
                None => (false, None, None),
            };
            self.emit(TimelapseEvent::SnapshotComplete {
                sequence: done.sequence,
                success,
                error,
                path,
                snapshot_count,
                seconds_added: done.seconds_added.unwrap_or_default(),
            });
        }
        if self.pending.is_empty() {
            if let Some(reason) = self.pending_render.take() {
                self.emit_render_ready(reason);
            }
        }
    }

    /// Enforces the position timeout of the current wait state.
    pub fn on_tick(&mut self, now: Instant) {
        self.process_capture_results();
        let Some(protocol) = self.protocol.as_ref() else {
            return;
        };
        if now < protocol.deadline {
            return;
        }
        let awaiting = protocol.awaiting_echo;
        warn!("Timed out in {:?} (awaiting {:?})", self.state, awaiting);
        match self.state {
            TimelapseState::RequestingReturnPosition => {
                self.abort_protocol("Timed out waiting for the printer position".to_string(), true);
            }
            TimelapseState::SendingSnapshotGcode => {
                self.set_state(TimelapseState::TakingSnapshot);
                self.request_echo(EchoReason::SnapshotPosition);
            }
            TimelapseState::TakingSnapshot => {
                if !self.register_mismatch("Timed out waiting for the snapshot position".to_string()) {
                    self.capture_and_return();
                }
            }
            TimelapseState::SendingReturnGcode => {
                self.send_replay();
                self.finish_protocol();
            }
            _ => {}
        }
    }
}

fn build_components(
    config: &LapseConfig,
    clock: Arc<dyn TimeInterface>,
) -> (Position, Triggers, SnapshotPlanner, String) {
    let bounds = config.printer.volume.bounds();
    let position = Position::new(&config.printer);
    let triggers = Triggers::new(&config.triggers, &config.printer, clock);
    let stabilization = Stabilization::new(&config.stabilization, bounds);
    let planner = SnapshotPlanner::new(&config.printer, &config.snapshot, stabilization);
    let snapshot_token = normalize_command(&config.printer.snapshot_command);
    (position, triggers, planner, snapshot_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPrinter {
        actions: Mutex<Vec<String>>,
    }

    impl PrinterControl for RecordingPrinter {
        fn pause_print(&self) {
            self.actions.lock().unwrap().push("pause".to_string());
        }
        fn resume_print(&self) {
            self.actions.lock().unwrap().push("resume".to_string());
        }
        fn send_commands(&self, commands: &[String]) {
            self.actions.lock().unwrap().push(format!("send {}", commands.len()));
        }
        fn request_position_echo(&self, reason: EchoReason) {
            self.actions.lock().unwrap().push(format!("echo {:?}", reason));
        }
    }

    fn coordinator() -> (TimelapseCoordinator, Arc<RecordingPrinter>, mpsc::UnboundedReceiver<TimelapseEvent>) {
        let printer = Arc::new(RecordingPrinter::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = TimelapseCoordinator::new(LapseConfig::default(), printer.clone(), tx);
        (coordinator, printer, rx)
    }

    #[test]
    fn test_idle_passes_commands_and_drops_token() {
        let (mut c, _, _) = coordinator();
        assert_eq!(c.on_command_queuing("G28"), QueueDecision::Pass);
        assert_eq!(c.on_command_queuing("@SNAPSHOT"), QueueDecision::Suppress);
        assert_eq!(c.state(), TimelapseState::Idle);
    }

    #[test]
    fn test_trigger_pauses_and_requests_position() {
        let (mut c, printer, mut events) = coordinator();
        c.on_print_start("cube.gcode");
        assert!(matches!(events.try_recv(), Ok(TimelapseEvent::PrintStarted { .. })));
        c.on_command_queuing("G28");
        c.on_command_queuing("G1 X10 Y10 Z0.2");
        assert_eq!(c.on_command_queuing("@SNAPSHOT"), QueueDecision::Suppress);
        assert_eq!(c.state(), TimelapseState::RequestingReturnPosition);
        assert_eq!(*printer.actions.lock().unwrap(), vec!["pause", "echo ReturnPosition"]);
        assert!(matches!(events.try_recv(), Ok(TimelapseEvent::SnapshotStart { sequence: 1, .. })));

        assert_eq!(c.on_command_queuing("M105"), QueueDecision::Suppress);
        let (accepted, _) = c.on_position_received(10.0, 10.0, 0.2, None, Some(EchoReason::SnapshotPosition));
        assert!(!accepted);
    }

    #[test]
    fn test_unrequested_position_is_rejected() {
        let (mut c, _, _) = coordinator();
        let (accepted, message) = c.on_position_received(0.0, 0.0, 0.0, None, None);
        assert!(!accepted);
        assert_eq!(message, "No position report was requested");
    }

    #[test]
    fn test_wait_for_capture_without_receiver() {
        let (mut c, _, _) = coordinator();
        assert!(c.take_capture_receiver().is_some());
        assert!(c.take_capture_receiver().is_none());
        assert!(!tokio_test::block_on(c.wait_for_capture()));
    }

    #[test]
    fn test_capture_without_camera_fails_snapshot() {
        let (mut c, printer, mut events) = coordinator();
        c.on_print_start("cube.gcode");
        for cmd in ["G28", "G1 X10 Y10 Z0.2 F1800"] {
            c.on_command_queuing(cmd);
        }
        c.on_command_queuing("@SNAPSHOT");
        c.on_position_received(10.0, 10.0, 0.2, None, Some(EchoReason::ReturnPosition));
        let parking = c.protocol.as_ref().and_then(|p| p.plan.as_ref()).unwrap().snapshot_commands.clone();
        for cmd in &parking {
            assert_eq!(c.on_command_queuing(cmd), QueueDecision::Pass);
            c.on_command_sent(cmd);
        }
        let (x, y) = c.protocol.as_ref().and_then(|p| p.plan.as_ref()).map(|p| (p.target_x, p.target_y)).unwrap();
        c.on_position_received(x, y, 0.7, None, Some(EchoReason::SnapshotPosition));
        assert_eq!(c.state(), TimelapseState::SendingReturnGcode);
        assert_eq!(c.job().map(|j| j.failed_snapshot_count), Some(1));
        assert!(printer.actions.lock().unwrap().iter().any(|a| a == "echo SnapshotPosition"));

        let completed: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, TimelapseEvent::SnapshotComplete { .. }))
            .collect();
        assert!(completed.is_empty());
    }

    #[test]
    fn test_print_start_discards_running_snapshot() {
        let (mut c, _, _) = coordinator();
        c.on_print_start("cube.gcode");
        for cmd in ["G28", "G1 X10 Y10 Z0.2", "@SNAPSHOT"] {
            c.on_command_queuing(cmd);
        }
        assert!(c.state().is_taking_snapshot());

        c.on_print_start("cube.gcode");
        assert_eq!(c.state(), TimelapseState::WaitingForTrigger);
        assert!(c.protocol.is_none());
        let (accepted, _) = c.on_position_received(10.0, 10.0, 0.2, None, Some(EchoReason::ReturnPosition));
        assert!(!accepted);
    }

    #[test]
    fn test_user_pause_is_excluded_from_timer() {
        let mut config = LapseConfig::default();
        config.triggers = vec![lapse_shared::config::TriggerConfig::new(
            lapse_shared::config::TriggerKind::Timer { interval_seconds: 5.0 },
        )];
        let clock = Arc::new(lapse_shared::ManualClock::new());
        let printer = Arc::new(RecordingPrinter::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut c = TimelapseCoordinator::new(config, printer, tx).with_clock(clock.clone());
        c.on_print_start("cube.gcode");
        c.on_command_queuing("G28");

        clock.advance(Duration::from_secs(3));
        c.on_print_paused();
        clock.advance(Duration::from_secs(60));
        c.on_print_resumed();
        clock.advance(Duration::from_secs(1));
        assert_eq!(c.on_command_queuing("G1 X5"), QueueDecision::Pass);

        clock.advance(Duration::from_secs(1));
        assert_eq!(c.on_command_queuing("G1 X6"), QueueDecision::Suppress);
        assert_eq!(c.state(), TimelapseState::RequestingReturnPosition);
    }
}
