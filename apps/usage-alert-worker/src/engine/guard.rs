use crate::error::StoreResult;
use crate::stats::EngineStats;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<T> {
    Inserted(T),
    /// A matching record was already present; nothing was written.
    AlreadyPresent,
    /// The write gate closed (session teardown) before the insert started.
    Suppressed,
}

/// Check-then-insert idempotence for derived records.
///
/// The check and the insert are separate store calls, so two concurrent
/// callers can both pass the check. Backends with unique indexes close that
/// window by reporting [`crate::error::StoreError::DuplicateKey`], which
/// lands here as [`Guarded::AlreadyPresent`].
#[derive(Debug, Clone)]
pub struct DedupGuard {
    gate: CancellationToken,
    stats: Arc<EngineStats>,
}

impl DedupGuard {
    pub fn new(gate: CancellationToken, stats: Arc<EngineStats>) -> Self {
        Self { gate, stats }
    }

    pub fn is_open(&self) -> bool {
        !self.gate.is_cancelled()
    }

    pub async fn insert_once<T, K, Check, Insert, InsertFut>(
        &self,
        kind: &'static str,
        key: &K,
        exists: Check,
        insert: Insert,
    ) -> StoreResult<Guarded<T>>
    where
        K: Debug + ?Sized,
        Check: Future<Output = StoreResult<bool>>,
        Insert: FnOnce() -> InsertFut,
        InsertFut: Future<Output = StoreResult<T>>,
    {
        if !self.is_open() {
            return Ok(Guarded::Suppressed);
        }

        if exists.await? {
            EngineStats::bump(&self.stats.duplicates_skipped);
            tracing::trace!(kind, ?key, "record already present");
            return Ok(Guarded::AlreadyPresent);
        }

        if !self.is_open() {
            tracing::debug!(kind, ?key, "write gate closed between check and insert");
            return Ok(Guarded::Suppressed);
        }

        match insert().await {
            Ok(record) => Ok(Guarded::Inserted(record)),
            Err(err) if err.is_duplicate() => {
                EngineStats::bump(&self.stats.duplicates_skipped);
                tracing::debug!(kind, ?key, error = %err, "insert lost a dedup race");
                Ok(Guarded::AlreadyPresent)
            }
            Err(err) => Err(err),
        }
    }
}
