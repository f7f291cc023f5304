use crate::error::UnknownAlertType;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::fmt;
use uuid::Uuid;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Hours between two instants, rounded to two decimals.
pub fn duration_hours(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds() as f64;
    (millis / MS_PER_HOUR * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntervalKey {
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUsageInterval {
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_hours: f64,
}

impl NewUsageInterval {
    pub fn between(device_id: &str, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            start_time,
            end_time,
            duration_hours: duration_hours(start_time, end_time),
        }
    }

    pub fn key(&self) -> IntervalKey {
        IntervalKey {
            device_id: self.device_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UsageInterval {
    pub id: Uuid,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_hours: f64,
}

impl UsageInterval {
    pub fn key(&self) -> IntervalKey {
        IntervalKey {
            device_id: self.device_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    /// Calendar day (UTC) that scopes overuse alerts for this interval.
    pub fn usage_day(&self) -> NaiveDate {
        self.end_time.date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum AlertType {
    Overuse,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overuse => "Overuse",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for AlertType {
    type Error = UnknownAlertType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            "Overuse" => Ok(Self::Overuse),
            _ => Err(UnknownAlertType(value)),
        }
    }
}

/// Dedup scope of an alert: one per owner, device, type and day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub user_id: String,
    pub device_id: String,
    pub alert_type: AlertType,
    pub day: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub user_id: String,
    pub device_id: String,
    pub alert_type: AlertType,
    pub timestamp: DateTime<Utc>,
    pub usage_day: NaiveDate,
}

impl NewAlert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            alert_type: self.alert_type,
            day: self.usage_day,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub user_id: String,
    pub device_id: String,
    #[sqlx(try_from = "String")]
    pub alert_type: AlertType,
    pub timestamp: DateTime<Utc>,
    /// Absent on alerts written before the day was recorded.
    #[serde(default)]
    pub usage_day: Option<NaiveDate>,
}

impl Alert {
    pub fn dedup_day(&self) -> NaiveDate {
        self.usage_day
            .unwrap_or_else(|| self.timestamp.date_naive())
    }

    pub fn matches(&self, key: &AlertKey) -> bool {
        self.user_id == key.user_id
            && self.device_id == key.device_id
            && self.alert_type == key.alert_type
            && self.dedup_day() == key.day
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub alert_id: Uuid,
    pub user_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub user_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn duration_hours_rounds_to_two_decimals() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        assert_eq!(duration_hours(start, start + Duration::minutes(6)), 0.1);
        assert_eq!(duration_hours(start, start + Duration::minutes(90)), 1.5);
        assert_eq!(duration_hours(start, start + Duration::seconds(20)), 0.01);
        assert_eq!(duration_hours(start, start), 0.0);
    }

    #[test]
    fn legacy_alerts_fall_back_to_timestamp_day() {
        let ts = Utc.with_ymd_and_hms(2026, 5, 2, 23, 59, 0).unwrap();
        let mut alert = Alert {
            id: Uuid::new_v4(),
            user_id: "ops@example.com".to_string(),
            device_id: "heater".to_string(),
            alert_type: AlertType::Overuse,
            timestamp: ts,
            usage_day: None,
        };
        let key = AlertKey {
            user_id: "ops@example.com".to_string(),
            device_id: "heater".to_string(),
            alert_type: AlertType::Overuse,
            day: NaiveDate::from_ymd_opt(2026, 5, 2).unwrap(),
        };
        assert!(alert.matches(&key));

        alert.usage_day = NaiveDate::from_ymd_opt(2026, 5, 1);
        assert!(!alert.matches(&key));
    }

    #[test]
    fn alert_payload_decodes_from_row_json() {
        let payload = r#"{
            "id": "6f1c2d8e-8f0a-4d55-9b8e-1f2a3b4c5d6e",
            "user_id": "ops@example.com",
            "device_id": "heater",
            "alert_type": "Overuse",
            "timestamp": "2026-05-02T10:15:00.123456+00:00",
            "usage_day": "2026-05-02"
        }"#;
        let alert: Alert = serde_json::from_str(payload).expect("decode alert");
        assert_eq!(alert.alert_type, AlertType::Overuse);
        assert_eq!(alert.usage_day, NaiveDate::from_ymd_opt(2026, 5, 2));
        assert!(AlertType::try_from("Underuse".to_string()).is_err());
    }
}
