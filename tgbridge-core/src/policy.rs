use crate::errors::{BridgeError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Reject references whose message is older than the configured expiry.
/// An expiry of 0 disables the gate.
pub fn check_link_expiry(
    message_date: DateTime<Utc>,
    expiry_seconds: u64,
    now: DateTime<Utc>,
) -> Result<()> {
    if expiry_seconds == 0 {
        return Ok(());
    }
    let age = now - message_date;
    if age > ChronoDuration::seconds(expiry_seconds as i64) {
        return Err(BridgeError::ReferenceExpired);
    }
    Ok(())
}

/// Per-IP sliding-window admission counter. Advisory: a consulted-once
/// gate at request admission, never held during the stream.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
    last_cleanup: Mutex<Instant>,
}

/// Tracked IPs are swept on this cadence to keep the map bounded.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Admit or reject one request from `ip` at `now`.
    pub fn check(&self, ip: &str, now: Instant) -> Result<()> {
        if self.max_requests == 0 {
            return Ok(());
        }
        self.maybe_cleanup(now);

        let mut requests = self.requests.lock();
        let window = self.window;
        let times = requests.entry(ip.to_string()).or_default();
        while times.front().is_some_and(|t| now.duration_since(*t) > window) {
            times.pop_front();
        }

        if times.len() < self.max_requests {
            times.push_back(now);
            return Ok(());
        }

        let oldest = *times.front().expect("nonempty at limit");
        let retry_after = window.saturating_sub(now.duration_since(oldest));
        Err(BridgeError::RateLimited {
            retry_after_seconds: retry_after.as_secs().max(1),
        })
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = self.last_cleanup.lock();
            if now.duration_since(*last) < CLEANUP_INTERVAL {
                return;
            }
            *last = now;
        }
        let mut requests = self.requests.lock();
        requests.retain(|_, times| {
            while times
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.window)
            {
                times.pop_front();
            }
            !times.is_empty()
        });
    }
}

/// Blocks IPs that spam malformed references, ahead of any decode work.
pub struct InvalidRequestGuard {
    max_invalid_per_minute: u32,
    block_duration: Duration,
    stats: Mutex<HashMap<String, IpStats>>,
}

struct IpStats {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

impl InvalidRequestGuard {
    pub fn new(max_invalid_per_minute: u32, block_duration: Duration) -> Self {
        Self {
            max_invalid_per_minute,
            block_duration,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_blocked(&self, ip: &str, now: Instant) -> bool {
        let stats = self.stats.lock();
        stats
            .get(ip)
            .and_then(|s| s.blocked_until)
            .is_some_and(|until| now < until)
    }

    pub fn record_invalid(&self, ip: &str, now: Instant) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(ip.to_string()).or_insert(IpStats {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        if now.duration_since(entry.window_start) > Duration::from_secs(60) {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count >= self.max_invalid_per_minute {
            entry.blocked_until = Some(now + self.block_duration);
            entry.count = 0;
            entry.window_start = now;
            tracing::warn!(ip, "blocking IP for repeated invalid requests");
        }
    }
}

impl Default for InvalidRequestGuard {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(120))
    }
}
