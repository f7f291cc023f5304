use super::guard::Guarded;
use super::UsageEngine;
use crate::error::StoreResult;
use crate::records::{Alert, AlertType, NewNotification, Notification};
use crate::stats::EngineStats;
use crate::store::AlertStream;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOrigin {
    Subscription,
    Evaluator,
    /// Re-offered from the owner's alert list by a scheduler cycle.
    Backfill,
}

#[derive(Debug, Clone)]
pub struct NotifyCommand {
    pub alert: Alert,
    pub origin: AlertOrigin,
}

/// Directory snapshot taken when the session became ready.
#[derive(Debug, Clone, Default)]
pub struct DeviceNames(HashMap<String, String>);

impl DeviceNames {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self(names)
    }

    pub fn display_name<'a>(&'a self, device_id: &'a str) -> &'a str {
        match self.0.get(device_id) {
            Some(name) if !name.trim().is_empty() => name.as_str(),
            _ => device_id,
        }
    }
}

pub fn notification_message(device_name: &str, alert_type: AlertType) -> String {
    format!("{device_name} - {alert_type} Alert!")
}

impl UsageEngine {
    pub async fn notify_alert(
        &self,
        names: &DeviceNames,
        alert: &Alert,
    ) -> StoreResult<Guarded<Notification>> {
        let store = &self.store;
        let outcome = self
            .guard
            .insert_once(
                "notification",
                &alert.id,
                async { Ok(!store.find_notifications(alert.id).await?.is_empty()) },
                || async {
                    let notification = NewNotification {
                        alert_id: alert.id,
                        user_id: self.owner_id.clone(),
                        message: notification_message(
                            names.display_name(&alert.device_id),
                            alert.alert_type,
                        ),
                        timestamp: Utc::now(),
                    };
                    store.insert_notification(&notification).await
                },
            )
            .await?;
        if let Guarded::Inserted(notification) = &outcome {
            EngineStats::bump(&self.stats.notifications_inserted);
            tracing::info!(
                alert_id = %alert.id,
                message = %notification.message,
                "notification recorded"
            );
        }
        Ok(outcome)
    }

    /// Offers every stored alert of the owner to the notifier again. Alerts
    /// that already have a notification are skipped by the notifier's guard,
    /// so this only fills in writes that were lost to a failure or teardown.
    pub async fn requeue_alerts(&self) -> StoreResult<usize> {
        let alerts = self.store.list_alerts(&self.owner_id).await?;
        let mut queued = 0;
        for alert in alerts {
            if !self.guard.is_open() {
                break;
            }
            let command = NotifyCommand {
                alert,
                origin: AlertOrigin::Backfill,
            };
            if self.notify_tx.send(command).await.is_err() {
                tracing::debug!("notifier stopped; backfill left to the next session");
                break;
            }
            queued += 1;
        }
        Ok(queued)
    }
}

/// Forwards subscription deliveries into the notify queue until cancelled.
/// Dropping the stream on exit unsubscribes.
pub fn spawn_watcher(
    mut alerts: AlertStream,
    tx: mpsc::Sender<NotifyCommand>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = alerts.next() => delivery,
            };
            match delivery {
                Some(Ok(alert)) => {
                    let command = NotifyCommand {
                        alert,
                        origin: AlertOrigin::Subscription,
                    };
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "alert subscription delivery failed");
                }
                None => {
                    tracing::warn!("alert subscription closed");
                    break;
                }
            }
        }
        tracing::debug!("alert watcher stopped");
    })
}

/// Single consumer of the notify queue; notification writes within a session
/// never overlap.
pub fn spawn_notifier(
    engine: UsageEngine,
    names: DeviceNames,
    mut rx: mpsc::Receiver<NotifyCommand>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = rx.recv() => command,
            };
            let Some(NotifyCommand { alert, origin }) = command else {
                break;
            };
            if let Err(err) = engine.notify_alert(&names, &alert).await {
                tracing::warn!(
                    error = %err,
                    alert_id = %alert.id,
                    origin = ?origin,
                    "failed to record notification"
                );
                engine.stats.record_error(err.to_string());
            }
        }
        tracing::debug!("notifier stopped");
    })
}
