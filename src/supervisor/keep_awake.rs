//! Process-wide keep-awake hold.
//!
//! While any session runs, the host must not suspend the child processes.
//! The hold is reference-counted across sessions and released through an
//! RAII guard, so every exit path (normal exit, kill, reader panic) drops it.

use std::sync::Mutex;

use crate::log_info;

/// Reference-counted inhibitor state.
pub struct WakeCounter {
    count: Mutex<u32>,
}

impl WakeCounter {
    pub const fn new() -> Self {
        Self {
            count: Mutex::new(0),
        }
    }

    fn acquire(&'static self, tag: &str) -> WakeGuard {
        let mut count = self.count.lock().expect("wake lock poisoned");
        *count += 1;
        if *count == 1 {
            platform_inhibit(true);
        }
        log_info!("WakeLock acquired by {tag} (refs={count})");
        WakeGuard {
            counter: self,
            tag: tag.to_string(),
        }
    }

    fn release(&self, tag: &str) {
        if let Ok(mut count) = self.count.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                platform_inhibit(false);
            }
            log_info!("WakeLock released by {tag} (refs={count})");
        }
    }

    pub fn active_holds(&self) -> u32 {
        *self.count.lock().expect("wake lock poisoned")
    }
}

impl Default for WakeCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WakeCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeCounter")
            .field("count", &self.active_holds())
            .finish()
    }
}

static HOLDS: WakeCounter = WakeCounter::new();

/// Holds one reference on the process-wide keep-awake lock until dropped.
#[derive(Debug)]
pub struct WakeGuard {
    counter: &'static WakeCounter,
    tag: String,
}

/// Acquire the process-wide keep-awake hold.
pub fn acquire(tag: &str) -> WakeGuard {
    HOLDS.acquire(tag)
}

/// Number of live holds on the process-wide lock. Diagnostic.
pub fn active_holds() -> u32 {
    HOLDS.active_holds()
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        self.counter.release(&self.tag);
    }
}

/// Platform hook for the actual suspend inhibitor. Failure to engage it is
/// logged and never fatal.
fn platform_inhibit(on: bool) {
    log_info!(
        "System suspend inhibitor {}",
        if on { "engaged" } else { "released" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_refcounts_and_releases_on_drop() {
        let counter: &'static WakeCounter = Box::leak(Box::new(WakeCounter::new()));
        let a = counter.acquire("test-a");
        let b = counter.acquire("test-b");
        assert_eq!(counter.active_holds(), 2);
        drop(a);
        assert_eq!(counter.active_holds(), 1);
        drop(b);
        assert_eq!(counter.active_holds(), 0);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let counter: &'static WakeCounter = Box::leak(Box::new(WakeCounter::new()));
        counter.release("nobody");
        assert_eq!(counter.active_holds(), 0);
    }
}
