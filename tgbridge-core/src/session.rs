use crate::errors::{BridgeError, Result};
use crate::models::FileLocator;
use crate::transport::{MediaTransport, TransportConnector};
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};

/// Cap on outstanding chunk reads per upstream session.
pub const SESSION_INFLIGHT_CAP: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    ReauthNeeded,
    Closed,
}

/// One long-lived authenticated channel to a data-center. Chunk reads are
/// bounded by a per-session semaphore; callers queue cooperatively.
pub struct UpstreamSession {
    identity_id: String,
    dc_id: i32,
    transport: Arc<dyn MediaTransport>,
    state: SyncMutex<SessionState>,
    inflight: Semaphore,
}

impl UpstreamSession {
    fn new(identity_id: String, dc_id: i32, transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            identity_id,
            dc_id,
            transport,
            state: SyncMutex::new(SessionState::Ready),
            inflight: Semaphore::new(SESSION_INFLIGHT_CAP),
        }
    }

    pub fn dc_id(&self) -> i32 {
        self.dc_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    fn close(&self) {
        *self.state.lock() = SessionState::Closed;
    }

    pub async fn fetch_chunk(&self, locator: &FileLocator, offset: u64, limit: u32) -> Result<Bytes> {
        if !self.is_ready() {
            return Err(BridgeError::UpstreamTransient(format!(
                "session {}/dc{} is not ready",
                self.identity_id, self.dc_id
            )));
        }
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| BridgeError::UpstreamUnavailable("session closed".to_string()))?;

        match self.transport.fetch_chunk(locator, offset, limit).await {
            Err(BridgeError::UpstreamAuthMigration { dc_id }) => {
                // This session can no longer serve the file; the caller
                // must reopen against the data-center named in the error.
                *self.state.lock() = SessionState::ReauthNeeded;
                Err(BridgeError::UpstreamAuthMigration { dc_id })
            }
            other => other,
        }
    }

    pub async fn fetch_metadata(&self, message_id: i64) -> Result<FileLocator> {
        if !self.is_ready() {
            return Err(BridgeError::UpstreamTransient(format!(
                "session {}/dc{} is not ready",
                self.identity_id, self.dc_id
            )));
        }
        self.transport.fetch_metadata(message_id).await
    }
}

type SessionKey = (String, i32);

/// One `UpstreamSession` per (identity, data-center). Opening a session is
/// slow, so it is serialized per key and concurrent callers share the
/// result.
pub struct SessionPool {
    connector: Arc<dyn TransportConnector>,
    sessions: RwLock<HashMap<SessionKey, Arc<UpstreamSession>>>,
    opening: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            connector,
            sessions: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        }
    }

    pub fn home_dc_id(&self) -> i32 {
        self.connector.home_dc_id()
    }

    pub async fn get_or_open(
        &self,
        identity_id: &str,
        token: &str,
        dc_id: i32,
    ) -> Result<Arc<UpstreamSession>> {
        let key = (identity_id.to_string(), dc_id);

        if let Some(session) = self.lookup_ready(&key).await {
            return Ok(session);
        }

        // Serialize the dial per (identity, dc); whoever loses the race
        // finds the winner's session on the double-check.
        let open_lock = {
            let mut opening = self.opening.lock().await;
            opening.entry(key.clone()).or_default().clone()
        };
        let _guard = open_lock.lock().await;

        if let Some(session) = self.lookup_ready(&key).await {
            return Ok(session);
        }

        tracing::debug!(identity = identity_id, dc = dc_id, "opening upstream session");
        let transport = self.connector.connect(token, dc_id).await.map_err(|e| {
            BridgeError::UpstreamUnavailable(format!(
                "failed to open session to dc {}: {}",
                dc_id, e
            ))
        })?;
        let session = Arc::new(UpstreamSession::new(identity_id.to_string(), dc_id, transport));

        let mut sessions = self.sessions.write().await;
        sessions.insert(key, session.clone());
        Ok(session)
    }

    async fn lookup_ready(&self, key: &SessionKey) -> Option<Arc<UpstreamSession>> {
        let sessions = self.sessions.read().await;
        sessions.get(key).filter(|s| s.is_ready()).cloned()
    }

    /// Close and remove the entry; the next `get_or_open` reopens.
    pub async fn invalidate(&self, identity_id: &str, dc_id: i32) {
        let key = (identity_id.to_string(), dc_id);
        let removed = self.sessions.write().await.remove(&key);
        if let Some(session) = removed {
            session.close();
            tracing::debug!(identity = identity_id, dc = dc_id, "invalidated upstream session");
        }
    }

    /// Whether the identity's session in the given dc exists and is ready,
    /// without opening one.
    pub async fn is_ready(&self, identity_id: &str, dc_id: i32) -> bool {
        let key = (identity_id.to_string(), dc_id);
        self.lookup_ready(&key).await.is_some()
    }
}
