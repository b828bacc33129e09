//! Bounded diagnostic log for long-running worker sessions.

use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Fixed-capacity drop-oldest line buffer. Observability only: nothing in
/// the lifecycle machinery reads it back.
pub struct RollingLog {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl RollingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a line with a `HH:MM:SS.mmm` timestamp, evicting the oldest
    /// entry once full.
    pub fn push(&self, line: &str) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let entry = format!("[{timestamp}] {line}");
        let mut lines = self.lines.lock().expect("rolling log poisoned");
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(entry);
    }

    pub fn clear(&self) {
        self.lines.lock().expect("rolling log poisoned").clear();
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("rolling log poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().expect("rolling log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RollingLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
