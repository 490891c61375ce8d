use std::collections::VecDeque;
use std::time::Duration;

/// Counters for one scheduler tick plus a few session-wide gauges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    /// Tick number within the streamer's lifetime.
    pub tick: u64,
    pub definitions_resolved: usize,
    pub partition_changes: usize,
    pub admitted: usize,
    pub preempted: usize,
    pub waiting: usize,
    pub started: usize,
    pub disposed: usize,
    pub failed: usize,
    pub loading: usize,
    pub running: usize,
    /// Placeholders shown, of any quality.
    pub placeholders: usize,
    pub reduced_placeholders: usize,
    pub placeholders_loading: usize,
    pub placeholders_started: usize,
    /// Promises created since the streamer was built (loads and requests).
    pub promises_created: u64,
    pub tick_time: Duration,
}

impl StreamStats {
    /// Cells holding a budget slot.
    pub fn occupied(&self) -> usize {
        self.loading + self.running
    }
}

/// Rolling window of tick durations.
#[derive(Debug, Clone)]
pub struct TickTimer {
    window: VecDeque<Duration>,
    capacity: usize,
    total: Duration,
}

impl TickTimer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            total: Duration::ZERO,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.window.len() == self.capacity {
            if let Some(oldest) = self.window.pop_front() {
                self.total -= oldest;
            }
        }
        self.window.push_back(elapsed);
        self.total += elapsed;
    }

    pub fn mean(&self) -> Duration {
        match self.window.len() {
            0 => Duration::ZERO,
            n => self.total / n as u32,
        }
    }

    pub fn worst(&self) -> Duration {
        self.window.iter().copied().max().unwrap_or_default()
    }

    pub fn best(&self) -> Duration {
        self.window.iter().copied().min().unwrap_or_default()
    }

    pub fn samples(&self) -> usize {
        self.window.len()
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new(120)
    }
}
