use super::deriver::latest_first;
use super::guard::DedupGuard;
use super::scheduler::{spawn_scheduler, CycleReport, ScheduleCommand};
use super::watcher::{spawn_notifier, spawn_watcher, DeviceNames};
use super::UsageEngine;
use crate::error::{EngineError, EngineResult};
use crate::records::UsageInterval;
use crate::stats::EngineStats;
use crate::store::{DeviceDirectory, UsageStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    LoadingDirectory,
    Ready,
    TearingDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::LoadingDirectory => "loading-directory",
            Self::Ready => "ready",
            Self::TearingDown => "tearing-down",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub owner_id: String,
    pub threshold_hours: f64,
    pub evaluate_interval: Duration,
    pub notify_queue: usize,
}

struct Running {
    cancel: CancellationToken,
    commands: mpsc::Sender<ScheduleCommand>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// One authenticated owner's engine lifetime: directory load, then the
/// scheduler, the alert subscription and the notifier until teardown.
pub struct Session {
    settings: SessionSettings,
    store: Arc<dyn UsageStore>,
    directory: Arc<dyn DeviceDirectory>,
    stats: Arc<EngineStats>,
    state: SessionState,
    running: Option<Running>,
}

impl Session {
    pub fn new(
        settings: SessionSettings,
        store: Arc<dyn UsageStore>,
        directory: Arc<dyn DeviceDirectory>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            settings,
            store,
            directory,
            stats,
            state: SessionState::Idle,
            running: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Loads the device directory and, once it is available, starts the
    /// scheduler and the alert subscription. A failure leaves the session in
    /// `loading-directory`; calling `start` again retries.
    pub async fn start(&mut self) -> EngineResult<()> {
        match self.state {
            SessionState::Idle | SessionState::LoadingDirectory => {}
            state => {
                return Err(EngineError::InvalidTransition {
                    action: "start",
                    state,
                })
            }
        }
        self.state = SessionState::LoadingDirectory;
        let owner_id = self.settings.owner_id.clone();

        let names = self
            .directory
            .load_device_names()
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, owner = %owner_id, "device directory load failed");
                EngineError::Directory(err)
            })?;
        let device_count = names.len();
        let alerts = self
            .store
            .subscribe_alerts(&owner_id)
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, owner = %owner_id, "alert subscription failed");
                EngineError::Subscribe(err)
            })?;

        let cancel = CancellationToken::new();
        let (notify_tx, notify_rx) = mpsc::channel(self.settings.notify_queue.max(1));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let engine = UsageEngine::new(
            self.store.clone(),
            owner_id.clone(),
            self.settings.threshold_hours,
            DedupGuard::new(cancel.clone(), self.stats.clone()),
            self.stats.clone(),
            notify_tx.clone(),
        );

        let tasks = vec![
            (
                "notifier",
                spawn_notifier(
                    engine.clone(),
                    DeviceNames::new(names),
                    notify_rx,
                    cancel.clone(),
                ),
            ),
            ("watcher", spawn_watcher(alerts, notify_tx, cancel.clone())),
            (
                "scheduler",
                spawn_scheduler(
                    engine,
                    self.settings.evaluate_interval,
                    command_rx,
                    cancel.clone(),
                ),
            ),
        ];
        self.running = Some(Running {
            cancel,
            commands: command_tx,
            tasks,
        });
        self.state = SessionState::Ready;
        tracing::info!(
            owner = %owner_id,
            devices = device_count,
            period_secs = self.settings.evaluate_interval.as_secs(),
            threshold_hours = self.settings.threshold_hours,
            "usage session ready"
        );
        Ok(())
    }

    /// Runs one derive-and-evaluate cycle on the scheduler task and waits for
    /// its report.
    pub async fn run_now(&self) -> EngineResult<CycleReport> {
        let running = match (&self.running, self.state) {
            (Some(running), SessionState::Ready) => running,
            (_, state) => {
                return Err(EngineError::InvalidTransition {
                    action: "run a cycle",
                    state,
                })
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        running
            .commands
            .send(ScheduleCommand::RunNow(reply_tx))
            .await
            .map_err(|_| EngineError::SchedulerGone)?;
        reply_rx.await.map_err(|_| EngineError::SchedulerGone)
    }

    /// Recorded usage intervals, one per key, most recent end_time first.
    pub async fn usage_intervals(&self) -> EngineResult<Vec<UsageInterval>> {
        Ok(latest_first(self.store.read_usage_intervals().await?))
    }

    /// Cancels the subscription and timer and waits for the tasks to finish.
    /// No insert starts after this returns.
    pub async fn teardown(&mut self) -> EngineResult<()> {
        match self.state {
            SessionState::Idle => return Ok(()),
            SessionState::LoadingDirectory => {
                self.state = SessionState::Idle;
                return Ok(());
            }
            SessionState::Ready | SessionState::TearingDown => {}
        }
        self.state = SessionState::TearingDown;

        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            drop(running.commands);
            for (name, handle) in running.tasks {
                if let Err(err) = handle.await {
                    tracing::warn!(task = name, error = %err, "session task ended abnormally");
                }
            }
        }

        self.state = SessionState::Idle;
        let snapshot = self.stats.snapshot();
        tracing::info!(
            owner = %self.settings.owner_id,
            intervals = snapshot.intervals_inserted,
            alerts = snapshot.alerts_inserted,
            notifications = snapshot.notifications_inserted,
            duplicates = snapshot.duplicates_skipped,
            malformed = snapshot.malformed_events,
            cycles = snapshot.cycles_completed,
            failed_cycles = snapshot.cycles_failed,
            "usage session torn down"
        );
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_like_the_dashboard_labels() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::LoadingDirectory.to_string(), "loading-directory");
        assert_eq!(SessionState::Ready.to_string(), "ready");
        assert_eq!(SessionState::TearingDown.to_string(), "tearing-down");
    }
}
