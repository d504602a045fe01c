use std::time::Duration;

use tokio::time::Instant;

/// Connected-duration clock. Runs on tokio's clock so paused-time tests
/// observe exact durations.
#[derive(Debug, Default)]
pub struct CallTimer {
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock. Returns false (and changes nothing) if it has
    /// already been started once.
    pub fn start(&mut self) -> bool {
        if self.started.is_some() {
            return false;
        }
        self.started = Some(Instant::now());
        true
    }

    /// Stops the clock and returns whole elapsed seconds. A timer that never
    /// started reports zero; stopping twice returns the first reading.
    pub fn stop(&mut self) -> u64 {
        if self.elapsed.is_none() {
            self.elapsed = Some(self.started.map(|s| s.elapsed()).unwrap_or_default());
        }
        self.elapsed.unwrap_or_default().as_secs()
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.elapsed.is_none()
    }
}

/// `MM:SS`, as shown in the call window. Minutes keep counting past 59.
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
