// lapse_shared: G-code parsing, configuration and clock types shared by the
// coordinator, the simulator and the tests.

pub mod config;
pub mod gcode;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

// --- Shared Traits and Types ---

// TimeInterface trait
pub trait TimeInterface: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_wallclock(&self) -> SystemTime;
    fn sleep(&self, duration: Duration);
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeInterface for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }
    fn now_wallclock(&self) -> SystemTime {
        SystemTime::now()
    }
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start: Instant,
    wall_start: SystemTime,
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            wall_start: SystemTime::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, dt: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += dt;
    }

    fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeInterface for ManualClock {
    fn now_monotonic(&self) -> Instant {
        self.start + self.elapsed()
    }
    fn now_wallclock(&self) -> SystemTime {
        self.wall_start + self.elapsed()
    }
    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
