use super::guard::Guarded;
use super::watcher::{AlertOrigin, NotifyCommand};
use super::UsageEngine;
use crate::error::StoreResult;
use crate::records::{Alert, AlertKey, AlertType, NewAlert, UsageInterval};
use crate::stats::EngineStats;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluateReport {
    pub over_threshold: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub suppressed: bool,
}

/// Overuse alerts owed for `intervals`: one per device and usage day, for
/// intervals strictly longer than `threshold_hours`, skipping days that
/// `existing` alerts already cover.
pub fn select_overuse(
    intervals: &[UsageInterval],
    existing: &[Alert],
    owner_id: &str,
    threshold_hours: f64,
    now: DateTime<Utc>,
) -> Vec<NewAlert> {
    let mut covered: HashSet<AlertKey> = existing
        .iter()
        .filter(|alert| alert.user_id == owner_id && alert.alert_type == AlertType::Overuse)
        .map(|alert| AlertKey {
            user_id: alert.user_id.clone(),
            device_id: alert.device_id.clone(),
            alert_type: alert.alert_type,
            day: alert.dedup_day(),
        })
        .collect();

    let mut owed = Vec::new();
    for interval in intervals {
        if interval.duration_hours <= threshold_hours {
            continue;
        }
        let alert = NewAlert {
            user_id: owner_id.to_string(),
            device_id: interval.device_id.clone(),
            alert_type: AlertType::Overuse,
            timestamp: now,
            usage_day: interval.usage_day(),
        };
        if covered.insert(alert.key()) {
            owed.push(alert);
        }
    }
    owed
}

impl UsageEngine {
    pub async fn evaluate_thresholds(&self) -> StoreResult<EvaluateReport> {
        self.evaluate_thresholds_at(Utc::now()).await
    }

    pub async fn evaluate_thresholds_at(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<EvaluateReport> {
        let intervals = self.store.read_usage_intervals().await?;
        let existing = self.store.list_alerts(&self.owner_id).await?;
        let owed = select_overuse(
            &intervals,
            &existing,
            &self.owner_id,
            self.threshold_hours,
            now,
        );

        let mut report = EvaluateReport {
            over_threshold: intervals
                .iter()
                .filter(|interval| interval.duration_hours > self.threshold_hours)
                .count(),
            ..Default::default()
        };

        for candidate in &owed {
            let key = candidate.key();
            let store = &self.store;
            let outcome = self
                .guard
                .insert_once(
                    "alert",
                    &key,
                    async { Ok(!store.find_alerts(&key).await?.is_empty()) },
                    || store.insert_alert(candidate),
                )
                .await?;
            match outcome {
                Guarded::Inserted(alert) => {
                    EngineStats::bump(&self.stats.alerts_inserted);
                    tracing::info!(
                        device = %alert.device_id,
                        day = %key.day,
                        alert_id = %alert.id,
                        "overuse alert raised"
                    );
                    report.inserted += 1;
                    let command = NotifyCommand {
                        alert,
                        origin: AlertOrigin::Evaluator,
                    };
                    if self.notify_tx.send(command).await.is_err() {
                        tracing::debug!("notifier stopped; alert left to the subscription");
                    }
                }
                Guarded::AlreadyPresent => report.already_present += 1,
                Guarded::Suppressed => {
                    report.suppressed = true;
                    break;
                }
            }
        }

        Ok(report)
    }
}
