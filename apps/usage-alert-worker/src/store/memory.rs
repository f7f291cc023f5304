//! In-process store with document-store semantics: appends never enforce
//! uniqueness, reads see everything written so far, alert inserts fan out to
//! subscribers. Failure switches simulate an unreachable backend.

use super::{AlertStream, DeviceDirectory, UsageStore};
use crate::error::{StoreError, StoreResult};
use crate::events::EventRecord;
use crate::records::{
    Alert, AlertKey, IntervalKey, NewAlert, NewNotification, NewUsageInterval, Notification,
    UsageInterval,
};
use async_trait::async_trait;
use futures::{future, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    events: Vec<EventRecord>,
    devices: HashMap<String, String>,
    intervals: Vec<UsageInterval>,
    alerts: Vec<Alert>,
    notifications: Vec<Notification>,
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    alerts_tx: broadcast::Sender<Alert>,
    next_event_id: AtomicUsize,
    fail_reads: AtomicBool,
    fail_directory: AtomicBool,
    fail_notifications: AtomicBool,
    notification_failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (alerts_tx, _) = broadcast::channel(64);
        Self {
            tables: Mutex::new(Tables::default()),
            alerts_tx,
            next_event_id: AtomicUsize::new(1),
            fail_reads: AtomicBool::new(false),
            fail_directory: AtomicBool::new(false),
            fail_notifications: AtomicBool::new(false),
            notification_failures: AtomicUsize::new(0),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("memory store poisoned")
    }

    pub fn push_raw_event(
        &self,
        device_id: Option<&str>,
        status_change: Option<&str>,
        timestamp: Option<&str>,
    ) {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        self.tables().events.push(EventRecord {
            id: format!("evt-{id}"),
            device_id: device_id.map(str::to_string),
            status_change: status_change.map(str::to_string),
            timestamp: timestamp.map(str::to_string),
        });
    }

    pub fn push_event(&self, device_id: &str, status_change: &str, timestamp: &str) {
        self.push_raw_event(Some(device_id), Some(status_change), Some(timestamp));
    }

    pub fn add_device(&self, id: &str, name: &str) {
        self.tables()
            .devices
            .insert(id.to_string(), name.to_string());
    }

    pub fn seed_alert(&self, alert: Alert) {
        self.tables().alerts.push(alert);
    }

    /// Re-publishes an alert as if the subscription delivered it again.
    pub fn redeliver(&self, alert: &Alert) {
        let _ = self.alerts_tx.send(alert.clone());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail_reads.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_directory_unreachable(&self, unreachable: bool) {
        self.fail_directory.store(unreachable, Ordering::SeqCst);
    }

    /// Fails only notification reads and writes; everything else keeps working.
    pub fn set_notifications_unreachable(&self, unreachable: bool) {
        self.fail_notifications.store(unreachable, Ordering::SeqCst);
    }

    pub fn notification_failures(&self) -> usize {
        self.notification_failures.load(Ordering::SeqCst)
    }

    pub fn intervals(&self) -> Vec<UsageInterval> {
        self.tables().intervals.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.tables().alerts.clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.tables().notifications.clone()
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn check_notifications_reachable(&self) -> StoreResult<()> {
        self.check_reachable()?;
        if self.fail_notifications.load(Ordering::SeqCst) {
            self.notification_failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("notification table offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn read_events(&self) -> StoreResult<Vec<EventRecord>> {
        self.check_reachable()?;
        let mut events = self.tables().events.clone();
        // Stable: equal timestamps keep insertion order.
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(events)
    }

    async fn find_usage_intervals(&self, key: &IntervalKey) -> StoreResult<Vec<UsageInterval>> {
        self.check_reachable()?;
        Ok(self
            .tables()
            .intervals
            .iter()
            .filter(|interval| interval.key() == *key)
            .cloned()
            .collect())
    }

    async fn insert_usage_interval(
        &self,
        interval: &NewUsageInterval,
    ) -> StoreResult<UsageInterval> {
        self.check_reachable()?;
        let row = UsageInterval {
            id: Uuid::new_v4(),
            device_id: interval.device_id.clone(),
            start_time: interval.start_time,
            end_time: interval.end_time,
            duration_hours: interval.duration_hours,
        };
        self.tables().intervals.push(row.clone());
        Ok(row)
    }

    async fn read_usage_intervals(&self) -> StoreResult<Vec<UsageInterval>> {
        self.check_reachable()?;
        Ok(self.tables().intervals.clone())
    }

    async fn list_alerts(&self, owner: &str) -> StoreResult<Vec<Alert>> {
        self.check_reachable()?;
        Ok(self
            .tables()
            .alerts
            .iter()
            .filter(|alert| alert.user_id == owner)
            .cloned()
            .collect())
    }

    async fn find_alerts(&self, key: &AlertKey) -> StoreResult<Vec<Alert>> {
        self.check_reachable()?;
        Ok(self
            .tables()
            .alerts
            .iter()
            .filter(|alert| alert.matches(key))
            .cloned()
            .collect())
    }

    async fn insert_alert(&self, alert: &NewAlert) -> StoreResult<Alert> {
        self.check_reachable()?;
        let row = Alert {
            id: Uuid::new_v4(),
            user_id: alert.user_id.clone(),
            device_id: alert.device_id.clone(),
            alert_type: alert.alert_type,
            timestamp: alert.timestamp,
            usage_day: Some(alert.usage_day),
        };
        self.tables().alerts.push(row.clone());
        let _ = self.alerts_tx.send(row.clone());
        Ok(row)
    }

    async fn subscribe_alerts(&self, owner: &str) -> StoreResult<AlertStream> {
        self.check_reachable()?;
        let owner = owner.to_string();
        let stream = BroadcastStream::new(self.alerts_tx.subscribe()).filter_map(move |delivery| {
            future::ready(match delivery {
                Ok(alert) if alert.user_id == owner => Some(Ok(alert)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(StoreError::Unavailable(
                    format!("alert subscription lagged by {skipped}"),
                ))),
            })
        });
        Ok(stream.boxed())
    }

    async fn find_notifications(&self, alert_id: Uuid) -> StoreResult<Vec<Notification>> {
        self.check_notifications_reachable()?;
        Ok(self
            .tables()
            .notifications
            .iter()
            .filter(|notification| notification.alert_id == alert_id)
            .cloned()
            .collect())
    }

    async fn insert_notification(
        &self,
        notification: &NewNotification,
    ) -> StoreResult<Notification> {
        self.check_notifications_reachable()?;
        let row = Notification {
            id: Uuid::new_v4(),
            alert_id: notification.alert_id,
            user_id: notification.user_id.clone(),
            message: notification.message.clone(),
            timestamp: notification.timestamp,
        };
        self.tables().notifications.push(row.clone());
        Ok(row)
    }
}

#[async_trait]
impl DeviceDirectory for MemoryStore {
    async fn load_device_names(&self) -> StoreResult<HashMap<String, String>> {
        if self.fail_directory.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("device directory offline".to_string()));
        }
        Ok(self.tables().devices.clone())
    }
}
