// src/print_job.rs
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintEndReason {
    Completed,
    Cancelled,
    Failed,
}

/// Bookkeeping for the print being recorded.
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub id: Uuid,
    pub print_file: String,
    pub start_time: DateTime<Local>,
    pub snapshot_count: u32,
    pub failed_snapshot_count: u32,
    /// Sequence number handed to the last capture.
    pub sequence: u32,
}

impl PrintJob {
    pub fn new(print_file: &str) -> Self {
        tracing::info!("Recording timelapse for print: {}", print_file);
        Self {
            id: Uuid::new_v4(),
            print_file: print_file.to_string(),
            start_time: Local::now(),
            snapshot_count: 0,
            failed_snapshot_count: 0,
            sequence: 0,
        }
    }

    pub fn next_sequence(&mut self) -> u32 {
        self.sequence += 1;
        self.sequence
    }

    pub fn record_capture(&mut self, success: bool) {
        if success {
            self.snapshot_count += 1;
        } else {
            self.failed_snapshot_count += 1;
        }
    }
}
