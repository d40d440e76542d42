//! SSH connection pool.
//!
//! One pool per sweep, keyed by node address and channel role, with
//! explicit lifecycle: `acquire` hands out a cached session after a
//! liveness check, `close_all` tears everything down. The map lock is
//! only ever held for a lookup or insert, never across an await.

use std::collections::HashMap;
use std::sync::Arc;

use openssh::{KnownHosts, Session, SessionBuilder};
use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::target::NodeDetails;

/// Each node holds two independent channels: one for command execution
/// and one for file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Control,
    Data,
}

pub struct ConnectionPool {
    connect_timeout: Duration,
    sessions: Mutex<HashMap<(String, Channel), Arc<Session>>>,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a live session for the given address and channel, reusing
    /// a cached one when it still responds.
    pub async fn acquire(
        &self,
        details: &NodeDetails,
        channel: Channel,
    ) -> Result<Arc<Session>, openssh::Error> {
        let key = (details.address.clone(), channel);

        let cached = self.sessions.lock().await.get(&key).cloned();
        if let Some(session) = cached {
            if session.check().await.is_ok() {
                return Ok(session);
            }
            tracing::debug!(address = %details.address, ?channel, "cached session went stale");
            self.sessions.lock().await.remove(&key);
        }

        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Add);
        builder.connect_timeout(self.connect_timeout);
        if let Some(username) = &details.username {
            builder.user(username.clone());
        }
        if let Some(key_path) = &details.key_path {
            builder.keyfile(key_path);
        }
        let session = builder.connect_mux(&details.address).await?;

        let mut map = self.sessions.lock().await;
        if let Some(existing) = map.get(&key) {
            // Another worker connected while we were; keep theirs.
            let existing = Arc::clone(existing);
            drop(map);
            let _ = session.close().await;
            return Ok(existing);
        }
        let session = Arc::new(session);
        map.insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Closes every cached session. Sessions still shared elsewhere are
    /// dropped from the pool and closed when their last holder lets go.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut map = self.sessions.lock().await;
            map.drain().collect()
        };
        for ((address, channel), session) in drained {
            match Arc::try_unwrap(session) {
                Ok(session) => {
                    if let Err(error) = session.close().await {
                        tracing::warn!(%address, ?channel, %error, "error closing session");
                    }
                }
                Err(_) => {
                    tracing::debug!(%address, ?channel, "session still in use, dropping pool ref");
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
