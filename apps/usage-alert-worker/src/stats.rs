use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct EngineStats {
    pub intervals_inserted: AtomicU64,
    pub alerts_inserted: AtomicU64,
    pub notifications_inserted: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub malformed_events: AtomicU64,
    pub cycles_completed: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub intervals_inserted: u64,
    pub alerts_inserted: u64,
    pub notifications_inserted: u64,
    pub duplicates_skipped: u64,
    pub malformed_events: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            intervals_inserted: AtomicU64::new(0),
            alerts_inserted: AtomicU64::new(0),
            notifications_inserted: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            malformed_events: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            intervals_inserted: self.intervals_inserted.load(Ordering::Relaxed),
            alerts_inserted: self.alerts_inserted.load(Ordering::Relaxed),
            notifications_inserted: self.notifications_inserted.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}
