use crate::bandwidth::BandwidthLedger;
use crate::dispatcher::ClientIdentity;
use crate::errors::{BridgeError, Result};
use crate::models::FileLocator;
use crate::registry::RegistrationGuard;
use crate::session::{SessionPool, UpstreamSession};
use bytes::Bytes;
use futures::Stream;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Immediate retries for transient upstream errors within one chunk.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;
/// Auth-migration redials allowed before a stream is declared dead.
pub const MAX_DC_HOPS: u32 = 3;

const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Chunk-aligned coverage of one requested byte interval `[from, until]`
/// (inclusive bounds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: u64,
    pub from: u64,
    pub until: u64,
    pub aligned_offset: u64,
    pub parts: u64,
}

impl ChunkPlan {
    pub fn compute(from: u64, until: u64, chunk_size: u64) -> Self {
        debug_assert!(from <= until);
        debug_assert!(chunk_size.is_power_of_two());
        let aligned_offset = from - (from % chunk_size);
        let parts = until / chunk_size - from / chunk_size + 1;
        Self {
            chunk_size,
            from,
            until,
            aligned_offset,
            parts,
        }
    }

    /// Bytes dropped from the head of the first chunk.
    pub fn first_trim(&self) -> u64 {
        self.from - self.aligned_offset
    }

    /// Bytes dropped from the tail of the last chunk, relative to a full
    /// final chunk.
    pub fn last_trim(&self) -> u64 {
        let end = self.until + 1;
        end.div_ceil(self.chunk_size) * self.chunk_size - end
    }

    pub fn length(&self) -> u64 {
        self.until - self.from + 1
    }
}

/// Slice one upstream chunk down to its intersection with the requested
/// interval, rejecting chunks shorter than the interval needs.
fn trim_part(plan: &ChunkPlan, chunk_offset: u64, data: Bytes, is_last: bool) -> Result<Bytes> {
    let data_end = chunk_offset + data.len() as u64;
    if is_last {
        if data_end < plan.until + 1 {
            return Err(BridgeError::ShortChunk {
                offset: chunk_offset,
                expected: (plan.until + 1 - chunk_offset) as usize,
                got: data.len(),
            });
        }
    } else if (data.len() as u64) < plan.chunk_size {
        return Err(BridgeError::ShortChunk {
            offset: chunk_offset,
            expected: plan.chunk_size as usize,
            got: data.len(),
        });
    }

    let lead = plan.from.max(chunk_offset) - chunk_offset;
    let keep_end = (plan.until + 1).min(data_end) - chunk_offset;
    Ok(data.slice(lead as usize..keep_end as usize))
}

struct FetchState {
    pool: Arc<SessionPool>,
    identity: Arc<ClientIdentity>,
    ledger: Arc<BandwidthLedger>,
    /// Keeps the registry entry and the identity slot alive exactly as long
    /// as the stream; dropping the stream releases both.
    registration: RegistrationGuard,
    locator: Arc<FileLocator>,
    plan: ChunkPlan,
    dc_id: i32,
    part_index: u64,
    session: Option<Arc<UpstreamSession>>,
}

/// Produce the bytes `[plan.from, plan.until]` of the file as a lazy,
/// strictly ordered stream of trimmed chunks.
///
/// The stream suspends between chunks until the consumer drains the
/// previous one, which is what throttles upstream fetches for slow
/// clients. Cancellation (client disconnect or reaper) is observed before
/// every fetch and also interrupts an in-flight read.
pub fn stream_range(
    pool: Arc<SessionPool>,
    identity: Arc<ClientIdentity>,
    ledger: Arc<BandwidthLedger>,
    registration: RegistrationGuard,
    locator: Arc<FileLocator>,
    plan: ChunkPlan,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    let dc_id = locator.dc_id;
    let state = FetchState {
        pool,
        identity,
        ledger,
        registration,
        locator,
        plan,
        dc_id,
        part_index: 0,
        session: None,
    };

    futures::stream::try_unfold(state, |mut st| async move {
        if st.part_index >= st.plan.parts {
            return Ok(None);
        }
        if st.registration.handle().is_cancelled() {
            return Err(BridgeError::ClientCancelled);
        }

        let chunk_offset = st.plan.aligned_offset + st.part_index * st.plan.chunk_size;
        let raw = fetch_part(&mut st, chunk_offset).await?;
        let is_last = st.part_index + 1 == st.plan.parts;
        let sliced = trim_part(&st.plan, chunk_offset, raw, is_last)?;

        st.registration.handle().record_sent(sliced.len() as u64);
        st.ledger.accrue(sliced.len() as u64);
        st.part_index += 1;
        Ok(Some((sliced, st)))
    })
}

/// Fetch one aligned chunk, retrying transient failures with backoff and
/// following auth migrations to other data-centers. Each loop turn ends in
/// one of three ways: a chunk, a redial against a new dc, or a fatal error.
async fn fetch_part(st: &mut FetchState, chunk_offset: u64) -> Result<Bytes> {
    let mut transient_attempts: u32 = 0;
    let mut dc_hops: u32 = 0;

    loop {
        let session = match &st.session {
            Some(s) if s.is_ready() => s.clone(),
            _ => {
                let opened = st
                    .pool
                    .get_or_open(st.identity.id(), st.identity.token(), st.dc_id)
                    .await?;
                st.session = Some(opened.clone());
                opened
            }
        };

        let handle = st.registration.handle().clone();
        let outcome = tokio::select! {
            biased;
            _ = handle.cancelled() => return Err(BridgeError::ClientCancelled),
            res = session.fetch_chunk(&st.locator, chunk_offset, st.plan.chunk_size as u32) => res,
        };

        match outcome {
            Ok(bytes) => return Ok(bytes),
            Err(BridgeError::UpstreamAuthMigration { dc_id }) => {
                dc_hops += 1;
                if dc_hops > MAX_DC_HOPS {
                    return Err(BridgeError::UpstreamUnavailable(format!(
                        "gave up after {} data-center migrations",
                        MAX_DC_HOPS
                    )));
                }
                tracing::info!(
                    identity = st.identity.id(),
                    from_dc = st.dc_id,
                    to_dc = dc_id,
                    "following auth migration"
                );
                st.pool.invalidate(st.identity.id(), st.dc_id).await;
                st.dc_id = dc_id;
                st.session = None;
            }
            Err(e) if e.is_transient() => {
                transient_attempts += 1;
                if transient_attempts > MAX_TRANSIENT_RETRIES {
                    return Err(BridgeError::RetryExhausted {
                        attempts: transient_attempts,
                        last_error: e.to_string(),
                    });
                }
                let delay = backoff_delay(transient_attempts);
                tracing::debug!(
                    identity = st.identity.id(),
                    offset = chunk_offset,
                    attempt = transient_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient chunk error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bounded exponential backoff with ±25% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(4));
    let capped = exp.min(BACKOFF_CAP_MS) as f64;
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((capped * jitter) as u64)
}
