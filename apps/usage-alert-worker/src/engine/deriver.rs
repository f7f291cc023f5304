use super::guard::Guarded;
use super::UsageEngine;
use crate::error::{MalformedRecord, StoreResult};
use crate::events::{DeviceState, Event, EventRecord};
use crate::records::{NewUsageInterval, UsageInterval};
use crate::stats::EngineStats;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
pub struct Derivation {
    pub candidates: Vec<NewUsageInterval>,
    pub malformed: Vec<MalformedRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeriveReport {
    pub candidates: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub malformed: usize,
    pub suppressed: bool,
}

/// Groups events by device, each list ascending by timestamp. Equal
/// timestamps keep the order they were read in.
pub fn partition_events(
    records: &[EventRecord],
) -> (BTreeMap<String, Vec<Event>>, Vec<MalformedRecord>) {
    let mut by_device: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    let mut malformed = Vec::new();

    for record in records {
        match Event::try_from(record) {
            Ok(event) => by_device
                .entry(event.device_id.clone())
                .or_default()
                .push(event),
            Err(err) => malformed.push(err),
        }
    }
    for events in by_device.values_mut() {
        events.sort_by_key(|event| event.timestamp);
    }

    (by_device, malformed)
}

/// Greedy adjacent pairing: an ON directly followed by an OFF becomes an
/// interval and both are consumed. Anything else advances by one, so a
/// leading OFF or an unmatched ON is dropped and in a run of ONs only the
/// last one can pair.
pub fn pair_device_events(device_id: &str, events: &[Event]) -> Vec<NewUsageInterval> {
    let mut intervals = Vec::new();
    let mut i = 0;
    while i < events.len() {
        let start = &events[i];
        match events.get(i + 1) {
            Some(end) if start.state == DeviceState::On && end.state == DeviceState::Off => {
                tracing::trace!(device = device_id, on = %start.id, off = %end.id, "paired events");
                intervals.push(NewUsageInterval::between(
                    device_id,
                    start.timestamp,
                    end.timestamp,
                ));
                i += 2;
            }
            _ => i += 1,
        }
    }
    intervals
}

pub fn derive_intervals(records: &[EventRecord]) -> Derivation {
    let (by_device, malformed) = partition_events(records);
    let candidates = by_device
        .iter()
        .flat_map(|(device_id, events)| pair_device_events(device_id, events))
        .collect();
    Derivation {
        candidates,
        malformed,
    }
}

/// Stored intervals with duplicate keys collapsed (first wins), newest
/// end_time first.
pub fn latest_first(records: Vec<UsageInterval>) -> Vec<UsageInterval> {
    let mut seen = HashSet::new();
    let mut unique: Vec<UsageInterval> = records
        .into_iter()
        .filter(|record| seen.insert(record.key()))
        .collect();
    unique.sort_by(|a, b| b.end_time.cmp(&a.end_time));
    unique
}

impl UsageEngine {
    pub async fn derive_usage_intervals(&self) -> StoreResult<DeriveReport> {
        let records = self.store.read_events().await?;
        let derivation = derive_intervals(&records);

        let mut report = DeriveReport {
            candidates: derivation.candidates.len(),
            malformed: derivation.malformed.len(),
            ..Default::default()
        };
        for err in &derivation.malformed {
            EngineStats::bump(&self.stats.malformed_events);
            tracing::debug!(error = %err, "skipping malformed event");
        }

        for candidate in &derivation.candidates {
            let key = candidate.key();
            let store = &self.store;
            let outcome = self
                .guard
                .insert_once(
                    "usage_interval",
                    &key,
                    async { Ok(!store.find_usage_intervals(&key).await?.is_empty()) },
                    || store.insert_usage_interval(candidate),
                )
                .await?;
            match outcome {
                Guarded::Inserted(interval) => {
                    EngineStats::bump(&self.stats.intervals_inserted);
                    tracing::debug!(
                        device = %interval.device_id,
                        start = %interval.start_time,
                        end = %interval.end_time,
                        hours = interval.duration_hours,
                        "usage interval recorded"
                    );
                    report.inserted += 1;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::duration_hours;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, 9, 0, 0).unwrap()
    }

    fn rec(id: &str, device: &str, status: &str, at: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            device_id: Some(device.to_string()),
            status_change: Some(status.to_string()),
            timestamp: Some(at.to_rfc3339()),
        }
    }

    #[test]
    fn single_on_off_pair_yields_one_interval() {
        let records = vec![
            rec("1", "fan", "Turned ON", t0()),
            rec("2", "fan", "Turned OFF", t0() + Duration::minutes(6)),
        ];
        let derivation = derive_intervals(&records);
        assert_eq!(derivation.candidates.len(), 1);
        let interval = &derivation.candidates[0];
        assert_eq!(interval.start_time, t0());
        assert_eq!(interval.end_time, t0() + Duration::minutes(6));
        assert!((interval.duration_hours - 0.10).abs() < 1e-9);
    }

    #[test]
    fn repeated_on_pairs_the_last_on_with_the_off() {
        let records = vec![
            rec("1", "fan", "Turned ON", t0()),
            rec("2", "fan", "Turned ON", t0() + Duration::minutes(1)),
            rec("3", "fan", "Turned OFF", t0() + Duration::minutes(7)),
        ];
        let derivation = derive_intervals(&records);
        assert_eq!(derivation.candidates.len(), 1);
        assert_eq!(derivation.candidates[0].start_time, t0() + Duration::minutes(1));
        assert_eq!(derivation.candidates[0].duration_hours, 0.1);
    }

    #[test]
    fn leading_off_and_trailing_on_are_dropped() {
        let records = vec![
            rec("1", "fan", "Turned OFF", t0()),
            rec("2", "fan", "Turned ON", t0() + Duration::minutes(10)),
            rec("3", "fan", "Turned OFF", t0() + Duration::minutes(40)),
            rec("4", "fan", "Turned OFF", t0() + Duration::minutes(50)),
            rec("5", "fan", "Turned ON", t0() + Duration::minutes(60)),
        ];
        let derivation = derive_intervals(&records);
        assert_eq!(derivation.candidates.len(), 1);
        assert_eq!(derivation.candidates[0].duration_hours, 0.5);
    }

    #[test]
    fn devices_are_paired_independently() {
        let records = vec![
            rec("1", "fan", "Turned ON", t0()),
            rec("2", "lamp", "Turned ON", t0() + Duration::minutes(1)),
            rec("3", "fan", "Turned OFF", t0() + Duration::minutes(30)),
            rec("4", "lamp", "Turned OFF", t0() + Duration::minutes(61)),
        ];
        let derivation = derive_intervals(&records);
        let mut devices: Vec<(&str, f64)> = derivation
            .candidates
            .iter()
            .map(|c| (c.device_id.as_str(), c.duration_hours))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(b.0));
        assert_eq!(devices, vec![("fan", 0.5), ("lamp", 1.0)]);
    }

    #[test]
    fn malformed_events_are_skipped_without_breaking_pairs() {
        let mut broken = rec("2", "fan", "Turned OFF", t0());
        broken.timestamp = Some("not a time".to_string());
        let records = vec![
            rec("1", "fan", "Turned ON", t0()),
            broken,
            rec("3", "fan", "Turned OFF", t0() + Duration::minutes(15)),
        ];
        let derivation = derive_intervals(&records);
        assert_eq!(derivation.malformed.len(), 1);
        assert_eq!(derivation.candidates.len(), 1);
        assert_eq!(derivation.candidates[0].duration_hours, 0.25);
    }

    #[test]
    fn partition_sorts_by_time_and_keeps_read_order_for_ties() {
        let records = vec![
            rec("late", "fan", "Turned OFF", t0() + Duration::minutes(5)),
            rec("tie-a", "fan", "Turned ON", t0()),
            rec("tie-b", "fan", "Turned OFF", t0()),
        ];
        let (by_device, malformed) = partition_events(&records);
        assert!(malformed.is_empty());
        let ids: Vec<&str> = by_device["fan"].iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["tie-a", "tie-b", "late"]);
    }

    #[test]
    fn stored_duration_matches_recomputed_span() {
        let records = vec![
            rec("1", "pump", "ON", t0()),
            rec("2", "pump", "OFF", t0() + Duration::seconds(4_321)),
        ];
        let candidate = &derive_intervals(&records).candidates[0];
        let recomputed = (candidate.end_time - candidate.start_time).num_milliseconds() as f64
            / 3_600_000.0;
        assert!((candidate.duration_hours - recomputed).abs() <= 0.01);
        assert_eq!(
            candidate.duration_hours,
            duration_hours(candidate.start_time, candidate.end_time)
        );
    }

    #[test]
    fn latest_first_collapses_duplicate_keys() {
        let stored = |device: &str, end_minutes: i64| UsageInterval {
            id: Uuid::new_v4(),
            device_id: device.to_string(),
            start_time: t0(),
            end_time: t0() + Duration::minutes(end_minutes),
            duration_hours: duration_hours(t0(), t0() + Duration::minutes(end_minutes)),
        };
        let first = stored("fan", 10);
        let listed = latest_first(vec![first.clone(), stored("fan", 10), stored("lamp", 30)]);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].device_id, "lamp");
        assert_eq!(listed[1].id, first.id);
    }
}
