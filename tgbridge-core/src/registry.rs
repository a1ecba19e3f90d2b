use crate::dispatcher::WipGuard;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// In-process record of one live HTTP response.
pub struct StreamHandle {
    id: String,
    identity_id: String,
    reference_id: i64,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    last_activity: Mutex<Instant>,
    bytes_sent: AtomicU64,
    cancel: CancellationToken,
    wip: WipGuard,
}

impl StreamHandle {
    pub fn new(reference_id: i64, wip: WipGuard) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id: wip.identity().id().to_string(),
            reference_id,
            started_at: Utc::now(),
            started_instant: now,
            last_activity: Mutex::new(now),
            bytes_sent: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            wip,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn reference_id(&self) -> i64 {
        self.reference_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// Record bytes handed to the response body and refresh liveness.
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::SeqCst);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.started_instant.elapsed()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Give the identity slot back. Idempotent.
    pub fn release_wip(&self) {
        self.wip.release();
    }
}

/// Process-wide map of in-flight streams, used for live accounting and
/// stale-stream reaping.
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, Arc<StreamHandle>>>,
    max_age: Duration,
}

impl StreamRegistry {
    pub fn new(max_age: Duration) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    pub fn register(&self, handle: Arc<StreamHandle>) {
        let mut streams = self.streams.lock();
        streams.insert(handle.id().to_string(), handle);
    }

    pub fn deregister(&self, stream_id: &str) -> Option<Arc<StreamHandle>> {
        self.streams.lock().remove(stream_id)
    }

    pub fn snapshot_count(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn active_for_identity(&self, identity_id: &str) -> usize {
        self.streams
            .lock()
            .values()
            .filter(|h| h.identity_id() == identity_id)
            .count()
    }

    /// Cancel and drop every stream idle longer than the configured
    /// maximum. Applying this twice with no intervening traffic removes
    /// nothing the second time.
    pub fn cleanup_stale(&self) -> usize {
        let stale: Vec<Arc<StreamHandle>> = {
            let streams = self.streams.lock();
            streams
                .values()
                .filter(|h| h.idle_for() > self.max_age)
                .cloned()
                .collect()
        };

        for handle in &stale {
            tracing::warn!(
                stream = handle.id(),
                identity = handle.identity_id(),
                idle_secs = handle.idle_for().as_secs(),
                "reaping stale stream"
            );
            handle.cancel();
            handle.release_wip();
            self.deregister(handle.id());
        }
        stale.len()
    }

    /// Run `cleanup_stale` on a timer until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = registry.cleanup_stale();
                if reaped > 0 {
                    tracing::info!(reaped, active = registry.snapshot_count(), "stale stream sweep");
                }
            }
        })
    }
}

/// Pairs a registry entry with its identity slot: dropping the guard
/// deregisters the stream and releases the slot on every exit path.
pub struct RegistrationGuard {
    registry: Arc<StreamRegistry>,
    handle: Arc<StreamHandle>,
}

impl RegistrationGuard {
    pub fn register(registry: Arc<StreamRegistry>, handle: Arc<StreamHandle>) -> Self {
        registry.register(handle.clone());
        Self { registry, handle }
    }

    pub fn handle(&self) -> &Arc<StreamHandle> {
        &self.handle
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.handle.id());
        self.handle.release_wip();
    }
}
