use crate::bandwidth::BandwidthLedger;
use crate::config::Config;
use crate::dispatcher::{ClientIdentity, Dispatcher, WipGuard};
use crate::errors::{BridgeError, Result};
use crate::fetcher::{stream_range, ChunkPlan};
use crate::locator::{CacheLookup, LocatorCache};
use crate::models::{
    is_video_file, BandwidthUsage, BotProfile, FileLocator, IdentityStatus, PublicUrls,
};
use crate::policy::{check_link_expiry, InvalidRequestGuard, RateLimiter};
use crate::reference;
use crate::registry::{RegistrationGuard, StreamHandle, StreamRegistry};
use crate::session::SessionPool;
use crate::storage::MongoStore;
use crate::transport::TransportConnector;
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Extra dispatcher selections allowed after an identity-specific failure.
const MAX_RESELECTIONS: usize = 2;

/// A dispatched request: the chosen identity still holds its streaming
/// slot (released when this is dropped or handed to a stream).
#[derive(Debug)]
pub struct ResolvedRequest {
    pub identity: Arc<ClientIdentity>,
    pub locator: Arc<FileLocator>,
    wip: WipGuard,
}

/// A registered, ready-to-pump stream and its live accounting handle.
pub struct OpenedStream<S> {
    pub handle: Arc<StreamHandle>,
    pub stream: S,
}

/// Root object owning all process-wide streaming state. Constructed once at
/// startup and shared with the HTTP handlers; there are no global
/// singletons behind it.
pub struct StreamingService {
    config: Config,
    pool: Arc<SessionPool>,
    dispatcher: Dispatcher,
    locators: HashMap<String, LocatorCache>,
    registry: Arc<StreamRegistry>,
    ledger: Arc<BandwidthLedger>,
    limiter: RateLimiter,
    guard: InvalidRequestGuard,
    store: Option<MongoStore>,
    bot_profile: Option<BotProfile>,
    started_at: chrono::DateTime<Utc>,
}

impl StreamingService {
    pub async fn new(
        config: Config,
        connector: Arc<dyn TransportConnector>,
        store: Option<MongoStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new(SessionPool::new(connector.clone()));
        let home_dc = pool.home_dc_id();

        let mut identities = Vec::new();
        let mut locators = HashMap::new();
        for (id, token) in config.identity_tokens() {
            match pool.get_or_open(&id, &token, home_dc).await {
                Ok(_) => tracing::info!(identity = %id, "identity session established"),
                Err(e) => {
                    // A dead identity stays configured but is never
                    // dispatched to until its session opens.
                    tracing::error!(identity = %id, error = %e, "failed to start identity");
                }
            }
            locators.insert(id.clone(), LocatorCache::new(config.locator_cache_max_entries));
            identities.push(Arc::new(ClientIdentity::new(id, token)));
        }

        let bot_profile = match connector.fetch_self(&config.primary_token).await {
            Ok(profile) => {
                tracing::info!(username = %profile.username, "primary identity profile loaded");
                Some(profile)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not load primary identity profile");
                None
            }
        };

        let dispatcher = Dispatcher::new(
            identities,
            pool.clone(),
            config.max_concurrent_streams_per_identity,
        );
        let registry = Arc::new(StreamRegistry::new(Duration::from_secs(
            config.stale_stream_max_age_seconds,
        )));
        let ledger = Arc::new(BandwidthLedger::new(
            config.monthly_bandwidth_ceiling_bytes,
            store.clone(),
        ));
        ledger.hydrate().await?;

        let limiter = RateLimiter::new(
            config.rate_limit_max_requests,
            Duration::from_secs(config.rate_limit_window_seconds),
        );

        Ok(Arc::new(Self {
            config,
            pool,
            dispatcher,
            locators,
            registry,
            ledger,
            limiter,
            guard: InvalidRequestGuard::default(),
            store,
            bot_profile,
            started_at: Utc::now(),
        }))
    }

    /// Start the stale-stream reaper, the ledger flush loop, and the
    /// session keeper that re-dials identities whose home session died.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let service = Arc::clone(self);
        let keeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.reopen_dead_sessions().await;
            }
        });

        vec![
            self.registry.spawn_reaper(Duration::from_secs(
                self.config.stream_cleanup_interval_seconds,
            )),
            self.ledger.spawn_flush_loop(Duration::from_secs(
                self.config.ledger_flush_interval_seconds,
            )),
            keeper,
        ]
    }

    async fn reopen_dead_sessions(&self) {
        let home_dc = self.pool.home_dc_id();
        for identity in self.dispatcher.identities() {
            if self.pool.is_ready(identity.id(), home_dc).await {
                continue;
            }
            match self
                .pool
                .get_or_open(identity.id(), identity.token(), home_dc)
                .await
            {
                Ok(_) => tracing::info!(identity = identity.id(), "session reestablished"),
                Err(e) => {
                    tracing::warn!(identity = identity.id(), error = %e, "session reopen failed")
                }
            }
        }
    }

    // =======================================================================
    // Admission
    // =======================================================================

    /// Per-request gates that need no upstream work: invalid-request block
    /// and the sliding-window rate limit.
    pub fn admit(&self, client_ip: &str) -> Result<()> {
        let now = Instant::now();
        if self.guard.is_blocked(client_ip, now) {
            return Err(BridgeError::RateLimited {
                retry_after_seconds: 120,
            });
        }
        self.limiter.check(client_ip, now)
    }

    /// Note a malformed reference from this IP.
    pub fn record_invalid_request(&self, client_ip: &str) {
        self.guard.record_invalid(client_ip, Instant::now());
    }

    pub fn decode_reference(&self, encoded: &str) -> Result<i64> {
        reference::decode(encoded)
    }

    // =======================================================================
    // Resolution
    // =======================================================================

    /// Run the pre-stream pipeline: identity dispatch, locator lookup, then
    /// the policy gates in order — link expiry first, bandwidth ceiling
    /// second. On identity-specific failures the failed identity is
    /// excluded and dispatch retried.
    pub async fn resolve(&self, message_id: i64) -> Result<ResolvedRequest> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_err: Option<BridgeError> = None;

        for _ in 0..=MAX_RESELECTIONS {
            let (identity, wip) = self.dispatcher.select(&excluded).await?;

            match self.locator_for(&identity, message_id).await {
                Ok(locator) => {
                    check_link_expiry(
                        locator.message_date,
                        self.config.link_expiry_seconds,
                        Utc::now(),
                    )?;
                    if self.ledger.is_exceeded() {
                        tracing::warn!(message_id, "rejecting request: bandwidth ceiling reached");
                        return Err(BridgeError::BandwidthCeilingReached);
                    }
                    return Ok(ResolvedRequest {
                        identity,
                        locator,
                        wip,
                    });
                }
                Err(e @ (BridgeError::ReferenceNotFound | BridgeError::ReferenceExpired)) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        identity = identity.id(),
                        message_id,
                        error = %e,
                        "identity failed during locator lookup, reselecting"
                    );
                    excluded.insert(identity.id().to_string());
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(BridgeError::NoClientAvailable))
    }

    /// Identity-scoped locator lookup with negative caching.
    async fn locator_for(
        &self,
        identity: &Arc<ClientIdentity>,
        message_id: i64,
    ) -> Result<Arc<FileLocator>> {
        let cache = self
            .locators
            .get(identity.id())
            .ok_or_else(|| BridgeError::Internal(format!("no cache for {}", identity.id())))?;

        match cache.get(message_id, Utc::now()) {
            CacheLookup::Hit(locator) => return Ok(locator),
            CacheLookup::NegativeHit => return Err(BridgeError::ReferenceNotFound),
            CacheLookup::Miss => {}
        }

        let primary = self
            .pool
            .get_or_open(identity.id(), identity.token(), self.pool.home_dc_id())
            .await?;
        match primary.fetch_metadata(message_id).await {
            Ok(locator) => {
                let locator = Arc::new(locator);
                cache.insert(locator.clone());
                Ok(locator)
            }
            Err(BridgeError::ReferenceNotFound) => {
                cache.insert_negative(message_id, Utc::now());
                Err(BridgeError::ReferenceNotFound)
            }
            Err(e) => Err(e),
        }
    }

    // =======================================================================
    // Streaming
    // =======================================================================

    /// Register a stream session and return the lazy chunk stream for
    /// `[from, until]` (inclusive). The registry entry and the identity
    /// slot are released when the stream is dropped, however it ends.
    pub fn open_stream(
        &self,
        resolved: ResolvedRequest,
        from: u64,
        until: u64,
    ) -> OpenedStream<impl Stream<Item = Result<Bytes>> + Send + 'static> {
        let plan = ChunkPlan::compute(from, until, self.config.chunk_size);
        let handle = StreamHandle::new(resolved.locator.message_id, resolved.wip);
        let registration = RegistrationGuard::register(self.registry.clone(), handle.clone());

        tracing::info!(
            stream = handle.id(),
            identity = resolved.identity.id(),
            message_id = resolved.locator.message_id,
            from,
            until,
            parts = plan.parts,
            "opening stream"
        );

        let stream = stream_range(
            self.pool.clone(),
            resolved.identity,
            self.ledger.clone(),
            registration,
            resolved.locator,
            plan,
        );
        OpenedStream { handle, stream }
    }

    // =======================================================================
    // Public URL construction
    // =======================================================================

    /// Build the public URLs handed back to the chat surface for a fresh
    /// upload. Shortening (when `should_shorten`) is the caller's job.
    pub fn build_public_urls(
        &self,
        message_id: i64,
        mime_type: Option<&str>,
    ) -> PublicUrls {
        let encoded = reference::encode(message_id);
        let download_url = format!("{}/dl/{}", self.config.base_url, encoded);

        let is_video = mime_type.map(is_video_file).unwrap_or(false);
        let stream_url = is_video.then(|| format!("{}/stream/{}", self.config.base_url, encoded));

        let player_url = match (&stream_url, &self.config.video_frontend_url) {
            (Some(stream), Some(frontend)) => Some(format!(
                "{}?stream={}",
                frontend,
                percent_encode_component(stream)
            )),
            _ => None,
        };

        PublicUrls {
            download_url,
            stream_url,
            player_url,
        }
    }

    pub fn should_shorten(&self, size: u64) -> bool {
        self.config.shorten_threshold_bytes > 0 && size > self.config.shorten_threshold_bytes
    }

    // =======================================================================
    // Introspection
    // =======================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bot_profile(&self) -> Option<&BotProfile> {
        self.bot_profile.as_ref()
    }

    pub fn active_streams(&self) -> usize {
        self.registry.snapshot_count()
    }

    pub fn bandwidth_usage(&self) -> BandwidthUsage {
        self.ledger.usage()
    }

    pub fn bandwidth_ledger(&self) -> &Arc<BandwidthLedger> {
        &self.ledger
    }

    pub fn started_at(&self) -> chrono::DateTime<Utc> {
        self.started_at
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }

    pub async fn identity_statuses(&self) -> Vec<IdentityStatus> {
        let home_dc = self.pool.home_dc_id();
        let mut out = Vec::new();
        for identity in self.dispatcher.identities() {
            // Registered streams, cross-checked against the identity's own
            // slot count; the two converge once no request is mid-setup.
            let registered = self.registry.active_for_identity(identity.id()) as u32;
            out.push(IdentityStatus {
                id: identity.id().to_string(),
                ready: self.pool.is_ready(identity.id(), home_dc).await,
                active_streams: registered.max(identity.wip()),
            });
        }
        out
    }

    pub async fn total_users(&self) -> u64 {
        match &self.store {
            Some(store) => store.total_users().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to count users");
                0
            }),
            None => 0,
        }
    }
}

/// Percent-encode a URL query component (everything but unreserved chars).
fn percent_encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
