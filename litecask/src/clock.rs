//! Store clock with second resolution.
//!
//! TTL expiry compares against this clock. The default reads the system
//! wall clock; a manual clock can be injected so tests control time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds-resolution clock, cheap to clone and share across threads.
#[derive(Debug, Clone)]
pub struct Clock {
    manual: Option<Arc<AtomicU32>>,
}

impl Clock {
    /// System wall clock (unix seconds).
    pub fn system() -> Self {
        Self { manual: None }
    }

    /// Manually driven clock starting at `start_sec`, for tests.
    pub fn manual(start_sec: u32) -> Self {
        Self {
            manual: Some(Arc::new(AtomicU32::new(start_sec))),
        }
    }

    /// Current time in unix seconds.
    pub fn now_sec(&self) -> u32 {
        match &self.manual {
            Some(cell) => cell.load(Ordering::Relaxed),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0),
        }
    }

    /// Advances a manual clock by `sec`. No effect on the system clock.
    pub fn advance(&self, sec: u32) {
        if let Some(cell) = &self.manual {
            cell.fetch_add(sec, Ordering::Relaxed);
        }
    }

    /// Sets a manual clock to `now_sec`. No effect on the system clock.
    pub fn set(&self, now_sec: u32) {
        if let Some(cell) = &self.manual {
            cell.store(now_sec, Ordering::Relaxed);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = Clock::manual(100);
        assert_eq!(clock.now_sec(), 100);
        clock.advance(5);
        assert_eq!(clock.now_sec(), 105);
        let shared = clock.clone();
        shared.set(1000);
        assert_eq!(clock.now_sec(), 1000);
    }

    #[test]
    fn test_system_clock_is_sane() {
        // After 2020, before 2100
        let now = Clock::system().now_sec();
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }
}
