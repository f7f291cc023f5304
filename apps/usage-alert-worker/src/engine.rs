mod deriver;
mod evaluator;
mod guard;
mod scheduler;
mod session;
mod watcher;


pub use session::{Session, SessionSettings, SessionState};

use crate::stats::EngineStats;
use crate::store::UsageStore;
use guard::DedupGuard;
use std::sync::Arc;
use tokio::sync::mpsc;
use watcher::NotifyCommand;

/// One session's view of the derivation pipeline. Cloned into the scheduler
/// and notifier tasks; every write goes through `guard`.
#[derive(Clone)]
pub struct UsageEngine {
    store: Arc<dyn UsageStore>,
    owner_id: String,
    threshold_hours: f64,
    guard: DedupGuard,
    stats: Arc<EngineStats>,
    notify_tx: mpsc::Sender<NotifyCommand>,
}

impl UsageEngine {
    pub fn new(
        store: Arc<dyn UsageStore>,
        owner_id: impl Into<String>,
        threshold_hours: f64,
        guard: DedupGuard,
        stats: Arc<EngineStats>,
        notify_tx: mpsc::Sender<NotifyCommand>,
    ) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            threshold_hours,
            guard,
            stats,
            notify_tx,
        }
    }
}
