use super::{AlertStream, DeviceDirectory, UsageStore};
use crate::error::{StoreError, StoreResult};
use crate::events::EventRecord;
use crate::records::{
    Alert, AlertKey, IntervalKey, NewAlert, NewNotification, NewUsageInterval, Notification,
    UsageInterval,
};
use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

pub const ALERT_CHANNEL: &str = "alerts_inserted";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS device_events (
        id bigserial primary key,
        device_id text null,
        status_change text null,
        "timestamp" text null,
        user_id text null,
        created_at timestamptz not null default now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id text primary key,
        name text not null default '',
        user_id text null
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS usage_intervals (
        id uuid primary key,
        device_id text not null,
        start_time timestamptz not null,
        end_time timestamptz not null,
        duration_hours double precision not null,
        created_at timestamptz not null default now()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS usage_intervals_key
        ON usage_intervals (device_id, start_time, end_time)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id uuid primary key,
        user_id text not null,
        device_id text not null,
        alert_type text not null,
        "timestamp" timestamptz not null,
        usage_day date null
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS alerts_daily_key
        ON alerts (user_id, device_id, alert_type, usage_day)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id uuid primary key,
        alert_id uuid not null,
        user_id text not null,
        message text not null,
        "timestamp" timestamptz not null
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS notifications_alert_key
        ON notifications (alert_id)
    "#,
    r#"
    CREATE OR REPLACE FUNCTION notify_alert_inserted() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('alerts_inserted', row_to_json(NEW)::text);
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS alerts_inserted_notify ON alerts"#,
    r#"
    CREATE TRIGGER alerts_inserted_notify
        AFTER INSERT ON alerts
        FOR EACH ROW EXECUTE FUNCTION notify_alert_inserted()
    "#,
];

pub async fn build_pool(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn conflict(what: &str) -> StoreError {
    StoreError::DuplicateKey(format!("{what} already exists"))
}

#[async_trait]
impl UsageStore for PgStore {
    async fn read_events(&self) -> StoreResult<Vec<EventRecord>> {
        let rows: Vec<EventRecord> = sqlx::query_as(
            r#"
            SELECT id::text AS id, device_id, status_change, "timestamp"
            FROM device_events
            ORDER BY "timestamp" ASC NULLS LAST, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_usage_intervals(&self, key: &IntervalKey) -> StoreResult<Vec<UsageInterval>> {
        let rows: Vec<UsageInterval> = sqlx::query_as(
            r#"
            SELECT id, device_id, start_time, end_time, duration_hours
            FROM usage_intervals
            WHERE device_id = $1 AND start_time = $2 AND end_time = $3
            "#,
        )
        .bind(&key.device_id)
        .bind(key.start_time)
        .bind(key.end_time)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_usage_interval(
        &self,
        interval: &NewUsageInterval,
    ) -> StoreResult<UsageInterval> {
        let row: Option<UsageInterval> = sqlx::query_as(
            r#"
            INSERT INTO usage_intervals (id, device_id, start_time, end_time, duration_hours)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id, start_time, end_time) DO NOTHING
            RETURNING id, device_id, start_time, end_time, duration_hours
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&interval.device_id)
        .bind(interval.start_time)
        .bind(interval.end_time)
        .bind(interval.duration_hours)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| conflict("usage interval"))
    }

    async fn read_usage_intervals(&self) -> StoreResult<Vec<UsageInterval>> {
        let rows: Vec<UsageInterval> = sqlx::query_as(
            r#"
            SELECT id, device_id, start_time, end_time, duration_hours
            FROM usage_intervals
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_alerts(&self, owner: &str) -> StoreResult<Vec<Alert>> {
        let rows: Vec<Alert> = sqlx::query_as(
            r#"
            SELECT id, user_id, device_id, alert_type, "timestamp", usage_day
            FROM alerts
            WHERE user_id = $1
            ORDER BY "timestamp" DESC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_alerts(&self, key: &AlertKey) -> StoreResult<Vec<Alert>> {
        let rows: Vec<Alert> = sqlx::query_as(
            r#"
            SELECT id, user_id, device_id, alert_type, "timestamp", usage_day
            FROM alerts
            WHERE user_id = $1
              AND device_id = $2
              AND alert_type = $3
              AND (
                usage_day = $4
                OR (usage_day IS NULL AND ("timestamp" AT TIME ZONE 'UTC')::date = $4)
              )
            "#,
        )
        .bind(&key.user_id)
        .bind(&key.device_id)
        .bind(key.alert_type.as_str())
        .bind(key.day)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_alert(&self, alert: &NewAlert) -> StoreResult<Alert> {
        let row: Option<Alert> = sqlx::query_as(
            r#"
            INSERT INTO alerts (id, user_id, device_id, alert_type, "timestamp", usage_day)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            RETURNING id, user_id, device_id, alert_type, "timestamp", usage_day
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&alert.user_id)
        .bind(&alert.device_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.timestamp)
        .bind(alert.usage_day)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| conflict("alert"))
    }

    async fn subscribe_alerts(&self, owner: &str) -> StoreResult<AlertStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(ALERT_CHANNEL).await?;
        let owner = owner.to_string();

        let stream = listener.into_stream().filter_map(move |delivery| {
            let owner = owner.clone();
            async move {
                let notification = match delivery {
                    Ok(notification) => notification,
                    Err(err) => return Some(Err(StoreError::from(err))),
                };
                match serde_json::from_str::<Alert>(notification.payload()) {
                    Ok(alert) if alert.user_id == owner => Some(Ok(alert)),
                    Ok(_) => None,
                    Err(err) => Some(Err(StoreError::Decode {
                        what: "alert notification payload",
                        reason: err.to_string(),
                    })),
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn find_notifications(&self, alert_id: Uuid) -> StoreResult<Vec<Notification>> {
        let rows: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT id, alert_id, user_id, message, "timestamp"
            FROM notifications
            WHERE alert_id = $1
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_notification(
        &self,
        notification: &NewNotification,
    ) -> StoreResult<Notification> {
        let row: Option<Notification> = sqlx::query_as(
            r#"
            INSERT INTO notifications (id, alert_id, user_id, message, "timestamp")
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (alert_id) DO NOTHING
            RETURNING id, alert_id, user_id, message, "timestamp"
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification.alert_id)
        .bind(&notification.user_id)
        .bind(&notification.message)
        .bind(notification.timestamp)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| conflict("notification"))
    }
}

#[async_trait]
impl DeviceDirectory for PgStore {
    async fn load_device_names(&self) -> StoreResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, name
            FROM devices
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}
