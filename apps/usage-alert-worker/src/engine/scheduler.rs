use super::deriver::DeriveReport;
use super::evaluator::EvaluateReport;
use super::UsageEngine;
use crate::error::StoreError;
use crate::stats::EngineStats;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    Tick,
    OnDemand,
}

#[derive(Debug)]
pub enum ScheduleCommand {
    RunNow(oneshot::Sender<CycleReport>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: CycleTrigger,
    pub derive: DeriveReport,
    pub evaluate: EvaluateReport,
    /// Stored alerts re-offered to the notifier.
    pub requeued: usize,
    /// Set when the cycle was abandoned on a store failure.
    pub error: Option<String>,
}

impl CycleReport {
    fn new(trigger: CycleTrigger) -> Self {
        Self {
            trigger,
            derive: DeriveReport::default(),
            evaluate: EvaluateReport::default(),
            requeued: 0,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl UsageEngine {
    /// Derive, evaluate, then requeue the owner's alerts for notification. A
    /// store failure abandons the rest of the cycle; the next trigger starts
    /// over.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> CycleReport {
        let mut report = CycleReport::new(trigger);
        match self.derive_then_evaluate(&mut report).await {
            Ok(()) => {
                EngineStats::bump(&self.stats.cycles_completed);
                self.stats.clear_error();
                tracing::debug!(
                    trigger = ?trigger,
                    candidates = report.derive.candidates,
                    intervals = report.derive.inserted,
                    intervals_present = report.derive.already_present,
                    malformed = report.derive.malformed,
                    over_threshold = report.evaluate.over_threshold,
                    alerts = report.evaluate.inserted,
                    alerts_present = report.evaluate.already_present,
                    requeued = report.requeued,
                    suppressed = report.derive.suppressed || report.evaluate.suppressed,
                    "usage cycle finished"
                );
            }
            Err(err) => {
                EngineStats::bump(&self.stats.cycles_failed);
                self.stats.record_error(err.to_string());
                tracing::warn!(error = %err, trigger = ?trigger, "usage cycle abandoned");
                report.error = Some(err.to_string());
            }
        }
        report
    }

    async fn derive_then_evaluate(&self, report: &mut CycleReport) -> Result<(), StoreError> {
        report.derive = self.derive_usage_intervals().await?;
        if report.derive.suppressed {
            return Ok(());
        }
        report.evaluate = self.evaluate_thresholds().await?;
        if report.evaluate.suppressed {
            return Ok(());
        }
        report.requeued = self.requeue_alerts().await?;
        Ok(())
    }
}

/// Runs a cycle immediately, then every `period`, plus whenever a
/// [`ScheduleCommand::RunNow`] arrives. Cycles never overlap.
pub fn spawn_scheduler(
    engine: UsageEngine,
    period: Duration,
    mut commands: mpsc::Receiver<ScheduleCommand>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => match command {
                    ScheduleCommand::RunNow(reply) => {
                        let report = engine.run_cycle(CycleTrigger::OnDemand).await;
                        let _ = reply.send(report);
                    }
                },
                _ = interval.tick() => {
                    engine.run_cycle(CycleTrigger::Tick).await;
                }
            }
        }
        tracing::debug!("scheduler stopped");
    })
}
