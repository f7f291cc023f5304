#[cfg(test)]
pub mod memory;
pub mod postgres;

use crate::error::StoreResult;
use crate::events::EventRecord;
use crate::records::{
    Alert, AlertKey, IntervalKey, NewAlert, NewNotification, NewUsageInterval, Notification,
    UsageInterval,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use uuid::Uuid;

/// Incremental "alert added" deliveries for one owner. Dropping the stream
/// unsubscribes.
pub type AlertStream = BoxStream<'static, StoreResult<Alert>>;

/// The document store the engine reads events from and appends derived
/// records to. Inserts are plain appends; uniqueness is the caller's job
/// unless the backend reports [`crate::error::StoreError::DuplicateKey`].
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Every event, ascending by timestamp, ties in insertion order.
    async fn read_events(&self) -> StoreResult<Vec<EventRecord>>;

    async fn find_usage_intervals(&self, key: &IntervalKey) -> StoreResult<Vec<UsageInterval>>;
    async fn insert_usage_interval(
        &self,
        interval: &NewUsageInterval,
    ) -> StoreResult<UsageInterval>;
    async fn read_usage_intervals(&self) -> StoreResult<Vec<UsageInterval>>;

    async fn list_alerts(&self, owner: &str) -> StoreResult<Vec<Alert>>;
    async fn find_alerts(&self, key: &AlertKey) -> StoreResult<Vec<Alert>>;
    async fn insert_alert(&self, alert: &NewAlert) -> StoreResult<Alert>;
    async fn subscribe_alerts(&self, owner: &str) -> StoreResult<AlertStream>;

    async fn find_notifications(&self, alert_id: Uuid) -> StoreResult<Vec<Notification>>;
    async fn insert_notification(
        &self,
        notification: &NewNotification,
    ) -> StoreResult<Notification>;
}

/// Device id to display name lookup over every known device, whoever owns it.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn load_device_names(&self) -> StoreResult<HashMap<String, String>>;
}
