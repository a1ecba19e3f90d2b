use crate::models::BandwidthUsage;
use crate::storage::MongoStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Persisted months kept when pruning old ledger records.
const KEEP_MONTHS: u32 = 3;

pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

fn cutoff_month(now: DateTime<Utc>) -> String {
    month_key(now - ChronoDuration::days(30 * KEEP_MONTHS as i64))
}

/// Append-only counter of bytes served, partitioned by calendar month.
///
/// Accrual is process-local and atomic; deltas are flushed to the document
/// store in batches. The month key is computed at accrual time, so a stream
/// crossing a month boundary accrues to both months.
pub struct BandwidthLedger {
    ceiling_bytes: u64,
    /// Resident totals per month (hydrated total + local accruals).
    totals: Mutex<HashMap<String, u64>>,
    /// Deltas not yet flushed to the store.
    pending: Mutex<HashMap<String, u64>>,
    store: Option<MongoStore>,
}

impl BandwidthLedger {
    pub fn new(ceiling_bytes: u64, store: Option<MongoStore>) -> Self {
        Self {
            ceiling_bytes,
            totals: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    pub fn is_enabled(&self) -> bool {
        self.ceiling_bytes > 0
    }

    /// Seed the current month's total from the store so restarts do not
    /// reset the ceiling.
    pub async fn hydrate(&self) -> crate::errors::Result<()> {
        if let Some(store) = &self.store {
            let month = month_key(Utc::now());
            let persisted = store.get_bandwidth(&month).await?;
            let mut totals = self.totals.lock();
            let entry = totals.entry(month).or_insert(0);
            *entry = (*entry).max(persisted);
        }
        Ok(())
    }

    /// Record bytes served. Called once per chunk handed to a response.
    pub fn accrue(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let month = month_key(Utc::now());
        *self.totals.lock().entry(month.clone()).or_insert(0) += bytes;
        *self.pending.lock().entry(month).or_insert(0) += bytes;
    }

    pub fn usage(&self) -> BandwidthUsage {
        let month = month_key(Utc::now());
        let bytes_used = self.totals.lock().get(&month).copied().unwrap_or(0);
        BandwidthUsage { month, bytes_used }
    }

    /// Gate check: true once the current month's accrued total has reached
    /// the ceiling.
    pub fn is_exceeded(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.usage().bytes_used >= self.ceiling_bytes
    }

    /// Push pending deltas to the store and prune months older than the
    /// retention window. Deltas are drained first and re-queued on failure,
    /// so a flush error loses nothing.
    pub async fn flush(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let drained: Vec<(String, u64)> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (month, bytes) in drained {
            if let Err(e) = store.add_bandwidth(&month, bytes).await {
                tracing::warn!(month = %month, error = %e, "bandwidth flush failed, re-queueing");
                *self.pending.lock().entry(month).or_insert(0) += bytes;
            }
        }

        let now = Utc::now();
        match store.prune_bandwidth(&cutoff_month(now), &month_key(now)).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "pruned old bandwidth records"),
            Err(e) => tracing::warn!(error = %e, "bandwidth prune failed"),
        }
    }

    pub fn spawn_flush_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                ledger.flush().await;
            }
        })
    }

    /// Preload an in-memory total, bypassing the store. Used by tests and
    /// by hydration.
    pub fn seed(&self, month: &str, bytes: u64) {
        self.totals.lock().insert(month.to_string(), bytes);
    }
}
