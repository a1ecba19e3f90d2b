use crate::errors::{BridgeError, Result};
use crate::session::SessionPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// One authenticated bot identity usable for fetching chunks.
#[derive(Debug)]
pub struct ClientIdentity {
    id: String,
    token: String,
    /// Count of concurrent streaming tasks currently assigned here.
    wip: AtomicU32,
}

impl ClientIdentity {
    pub fn new(id: String, token: String) -> Self {
        Self {
            id,
            token,
            wip: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn wip(&self) -> u32 {
        self.wip.load(Ordering::SeqCst)
    }

    /// Claim a streaming slot if the identity is below `max`. The returned
    /// guard releases the slot on drop, whatever the exit path.
    fn try_claim(self: &Arc<Self>, max: u32) -> Option<WipGuard> {
        let claimed = self
            .wip
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                if w < max {
                    Some(w + 1)
                } else {
                    None
                }
            })
            .is_ok();
        claimed.then(|| WipGuard {
            identity: Arc::clone(self),
            released: AtomicBool::new(false),
        })
    }
}

/// Scoped hold on an identity's streaming slot. Releasing twice is a no-op,
/// so the stale-stream reaper and the normal teardown path can race safely.
#[derive(Debug)]
pub struct WipGuard {
    identity: Arc<ClientIdentity>,
    released: AtomicBool,
}

impl WipGuard {
    pub fn identity(&self) -> &Arc<ClientIdentity> {
        &self.identity
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.identity.wip.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for WipGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Selects one identity per request by load: the ready identity with the
/// smallest work-in-progress count wins, config order breaking ties.
pub struct Dispatcher {
    identities: Vec<Arc<ClientIdentity>>,
    pool: Arc<SessionPool>,
    max_per_identity: u32,
}

impl Dispatcher {
    pub fn new(
        identities: Vec<Arc<ClientIdentity>>,
        pool: Arc<SessionPool>,
        max_per_identity: u32,
    ) -> Self {
        Self {
            identities,
            pool,
            max_per_identity,
        }
    }

    pub fn identities(&self) -> &[Arc<ClientIdentity>] {
        &self.identities
    }

    pub fn get(&self, identity_id: &str) -> Option<&Arc<ClientIdentity>> {
        self.identities.iter().find(|i| i.id() == identity_id)
    }

    /// Pick an identity and claim a slot on it atomically. Candidates whose
    /// primary session is not ready, whose slot table is full, or who are in
    /// `excluded` are skipped.
    pub async fn select(&self, excluded: &HashSet<String>) -> Result<(Arc<ClientIdentity>, WipGuard)> {
        let home_dc = self.pool.home_dc_id();

        let mut candidates: Vec<&Arc<ClientIdentity>> = Vec::new();
        for identity in &self.identities {
            if excluded.contains(identity.id()) {
                continue;
            }
            if self.pool.is_ready(identity.id(), home_dc).await {
                candidates.push(identity);
            }
        }
        // Stable sort keeps config order within equal load.
        candidates.sort_by_key(|i| i.wip());

        for identity in candidates {
            if let Some(guard) = identity.try_claim(self.max_per_identity) {
                tracing::debug!(
                    identity = identity.id(),
                    wip = identity.wip(),
                    "dispatched stream to identity"
                );
                return Ok((Arc::clone(identity), guard));
            }
        }
        Err(BridgeError::NoClientAvailable)
    }
}
