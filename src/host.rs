//! Host service: the single task that owns the coordinator.
//!
//! Print hosts talk to it through [`HostEvent`] messages. Hooks that need an
//! answer carry a `oneshot` responder.

use std::time::Duration;

use lapse_shared::config::LapseConfig;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::coordinator::{QueueDecision, TimelapseCoordinator};
use crate::print_job::PrintEndReason;
use crate::printer::EchoReason;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Capture result receiver was already taken")]
    CaptureReceiverTaken,
    #[error("Host service channel closed")]
    ChannelClosed,
}

/// A message from the print host to the coordinator task.
#[derive(Debug)]
pub enum HostEvent {
    PrintStarted {
        print_file: String,
    },
    PrintPaused,
    PrintResumed,
    PrintEnded {
        reason: PrintEndReason,
    },
    /// A command is about to be queued to the printer.
    CommandQueuing {
        command: String,
        respond_to: oneshot::Sender<QueueDecision>,
    },
    /// A command was written to the printer.
    CommandSent {
        command: String,
    },
    PositionReceived {
        x: f64,
        y: f64,
        z: f64,
        e: Option<f64>,
        reason: Option<EchoReason>,
        respond_to: Option<oneshot::Sender<(bool, String)>>,
    },
    StageConfig {
        config: Box<LapseConfig>,
    },
    Shutdown,
}

/// Runs the coordinator until `Shutdown` or until every sender is dropped,
/// then hands the coordinator back for inspection.
pub async fn run(
    mut coordinator: TimelapseCoordinator,
    mut events: mpsc::Receiver<HostEvent>,
    tick: Duration,
) -> Result<TimelapseCoordinator, HostError> {
    let mut captures = coordinator
        .take_capture_receiver()
        .ok_or(HostError::CaptureReceiverTaken)?;
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let clock = coordinator.clock();
    info!("Timelapse host service started");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("All host event senders dropped");
                    break;
                };
                if !handle_event(&mut coordinator, event) {
                    break;
                }
            }
            Some(outcome) = captures.recv() => coordinator.on_capture_result(outcome),
            _ = interval.tick() => coordinator.on_tick(clock.now_monotonic()),
        }
    }

    // Captures still in flight finish on their own; keep what already arrived.
    while let Ok(outcome) = captures.try_recv() {
        coordinator.on_capture_result(outcome);
    }
    info!("Timelapse host service stopped");
    Ok(coordinator)
}

fn handle_event(coordinator: &mut TimelapseCoordinator, event: HostEvent) -> bool {
    match event {
        HostEvent::PrintStarted { print_file } => coordinator.on_print_start(&print_file),
        HostEvent::PrintPaused => coordinator.on_print_paused(),
        HostEvent::PrintResumed => coordinator.on_print_resumed(),
        HostEvent::PrintEnded { reason } => coordinator.on_print_end(reason),
        HostEvent::CommandQueuing { command, respond_to } => {
            let decision = coordinator.on_command_queuing(&command);
            let _ = respond_to.send(decision);
        }
        HostEvent::CommandSent { command } => coordinator.on_command_sent(&command),
        HostEvent::PositionReceived { x, y, z, e, reason, respond_to } => {
            let result = coordinator.on_position_received(x, y, z, e, reason);
            if let Some(respond_to) = respond_to {
                let _ = respond_to.send(result);
            }
        }
        HostEvent::StageConfig { config } => coordinator.stage_config(*config),
        HostEvent::Shutdown => return false,
    }
    true
}

/// Cloneable handle for sending host events.
#[derive(Debug, Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<HostEvent>,
}

impl HostHandle {
    pub fn new(tx: mpsc::Sender<HostEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: HostEvent) -> Result<(), HostError> {
        self.tx.send(event).await.map_err(|_| HostError::ChannelClosed)
    }

    pub async fn queue_command(&self, command: &str) -> Result<QueueDecision, HostError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(HostEvent::CommandQueuing {
            command: command.to_string(),
            respond_to,
        })
        .await?;
        rx.await.map_err(|_| HostError::ChannelClosed)
    }

    pub async fn command_sent(&self, command: &str) -> Result<(), HostError> {
        self.send(HostEvent::CommandSent {
            command: command.to_string(),
        })
        .await
    }

    pub async fn report_position(
        &self,
        x: f64,
        y: f64,
        z: f64,
        reason: Option<EchoReason>,
    ) -> Result<(bool, String), HostError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(HostEvent::PositionReceived {
            x,
            y,
            z,
            e: None,
            reason,
            respond_to: Some(respond_to),
        })
        .await?;
        rx.await.map_err(|_| HostError::ChannelClosed)
    }
}
