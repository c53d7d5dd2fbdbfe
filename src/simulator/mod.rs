// src/simulator/mod.rs - Simulated printer used to replay G-code files
//
// The simulated firmware executes every command that makes it past the
// coordinator and answers position requests from its own tracker, so a
// whole print can be exercised without hardware.

use std::time::Duration;

use futures_core::Stream;
use futures_util::StreamExt;
use lapse_shared::config::PrinterConfig;
use lapse_shared::gcode::GCodeError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coordinator::QueueDecision;
use crate::host::{HostError, HostEvent, HostHandle};
use crate::position::Position;
use crate::print_job::PrintEndReason;
use crate::printer::{EchoReason, PrinterControl};

/// Something the coordinator asked the printer to do.
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterAction {
    Pause,
    Resume,
    Send(Vec<String>),
    RequestPosition(EchoReason),
}

#[derive(Debug, Clone)]
pub struct SimulatedPrinter {
    tx: mpsc::UnboundedSender<PrinterAction>,
}

impl SimulatedPrinter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PrinterAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, action: PrinterAction) {
        if self.tx.send(action).is_err() {
            debug!("Simulated printer is gone; dropping action");
        }
    }
}

impl PrinterControl for SimulatedPrinter {
    fn pause_print(&self) {
        self.push(PrinterAction::Pause);
    }

    fn resume_print(&self) {
        self.push(PrinterAction::Resume);
    }

    fn send_commands(&self, commands: &[String]) {
        self.push(PrinterAction::Send(commands.to_vec()));
    }

    fn request_position_echo(&self, reason: EchoReason) {
        self.push(PrinterAction::RequestPosition(reason));
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    pub lines: usize,
    /// Commands executed by the simulated firmware.
    pub executed: usize,
    pub suppressed: usize,
    pub injected: usize,
    pub position_reports: usize,
    pub pauses: usize,
    pub read_errors: usize,
}

pub struct Replay {
    host: HostHandle,
    actions: mpsc::UnboundedReceiver<PrinterAction>,
    firmware: Position,
    paused: bool,
    drain_timeout: Duration,
    summary: ReplaySummary,
}

impl Replay {
    pub fn new(host: HostHandle, actions: mpsc::UnboundedReceiver<PrinterAction>, printer: &PrinterConfig) -> Self {
        Self {
            host,
            actions,
            firmware: Position::new(printer),
            paused: false,
            drain_timeout: Duration::from_millis(500),
            summary: ReplaySummary::default(),
        }
    }

    /// How long to wait for further printer actions after the file ends.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Streams `lines` through the host service as a print of `print_file`.
    pub async fn run<S>(mut self, print_file: &str, mut lines: S) -> Result<ReplaySummary, HostError>
    where
        S: Stream<Item = Result<String, GCodeError>> + Unpin,
    {
        self.host
            .send(HostEvent::PrintStarted {
                print_file: print_file.to_string(),
            })
            .await?;

        loop {
            self.drain_actions().await?;
            if self.paused {
                match self.actions.recv().await {
                    Some(action) => {
                        self.apply(action).await?;
                        continue;
                    }
                    None => {
                        warn!("Printer control channel closed while paused");
                        break;
                    }
                }
            }
            match lines.next().await {
                Some(Ok(line)) => {
                    self.summary.lines += 1;
                    self.print_line(&line).await?;
                }
                Some(Err(e)) => {
                    warn!("Skipping unreadable G-code: {}", e);
                    self.summary.read_errors += 1;
                }
                None => break,
            }
        }

        self.host
            .send(HostEvent::PrintEnded {
                reason: PrintEndReason::Completed,
            })
            .await?;
        while let Ok(Some(action)) = tokio::time::timeout(self.drain_timeout, self.actions.recv()).await {
            self.apply(action).await?;
        }
        info!(
            "Replay finished: {} lines, {} executed, {} suppressed, {} injected",
            self.summary.lines, self.summary.executed, self.summary.suppressed, self.summary.injected
        );
        Ok(self.summary)
    }

    async fn drain_actions(&mut self) -> Result<(), HostError> {
        while let Ok(action) = self.actions.try_recv() {
            self.apply(action).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, action: PrinterAction) -> Result<(), HostError> {
        match action {
            PrinterAction::Pause => {
                self.paused = true;
                self.summary.pauses += 1;
            }
            PrinterAction::Resume => self.paused = false,
            PrinterAction::Send(commands) => {
                for command in commands {
                    self.summary.injected += 1;
                    self.print_line(&command).await?;
                }
            }
            PrinterAction::RequestPosition(reason) => {
                let state = self.firmware.state();
                let (x, y, z) = (
                    state.x.unwrap_or_default(),
                    state.y.unwrap_or_default(),
                    state.z.unwrap_or_default(),
                );
                self.summary.position_reports += 1;
                let (accepted, message) = self.host.report_position(x, y, z, Some(reason)).await?;
                debug!("Position report {:?} accepted={}: {}", reason, accepted, message);
            }
        }
        Ok(())
    }

    async fn print_line(&mut self, line: &str) -> Result<(), HostError> {
        match self.host.queue_command(line).await? {
            QueueDecision::Pass => {
                self.firmware.update(line);
                self.summary.executed += 1;
                self.host.command_sent(line).await
            }
            QueueDecision::Suppress => {
                self.summary.suppressed += 1;
                Ok(())
            }
        }
    }
}
