use super::connection::message::Message;
use super::connection::SessionHandle;
use crate::data_structures::ID;
use crate::lock;
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

#[derive(Debug, Default)]
struct Inner {
    active: HashMap<ID, SessionHandle>,
    // dials in progress, so the same address is not dialed twice
    connecting: HashSet<ID>,
    // remote peer id -> session key
    remote_ids: HashMap<ID, ID>,
}

/// Live sessions of one torrent, keyed by peer.
#[derive(Debug, Clone, Default)]
pub struct Sessions {
    inner: Arc<StdMutex<Inner>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key` for an outbound dial. False if it is already
    /// connected or being dialed.
    pub fn reserve(&self, key: ID) -> bool {
        let mut inner = lock!(self.inner);

        if inner.active.contains_key(&key) {
            return false;
        }

        inner.connecting.insert(key)
    }

    pub fn unreserve(&self, key: &ID) {
        lock!(self.inner).connecting.remove(key);
    }

    /// Makes a handshaken session visible. A second session to the same
    /// remote peer id is refused.
    pub fn register(&self, handle: SessionHandle) -> Result<()> {
        let mut inner = lock!(self.inner);
        let key = handle.peer.id();

        inner.connecting.remove(&key);

        if inner.active.contains_key(&key) {
            bail!("already connected to {}", handle.peer);
        }

        if let Some(existing) = inner.remote_ids.get(&handle.remote_id) {
            bail!(
                "remote id {} is already connected as {}",
                handle.remote_id,
                existing
            );
        }

        inner.remote_ids.insert(handle.remote_id, key);
        inner.active.insert(key, handle);

        Ok(())
    }

    pub fn remove(&self, key: &ID) -> Option<SessionHandle> {
        let mut inner = lock!(self.inner);

        let handle = inner.active.remove(key)?;
        inner.remote_ids.remove(&handle.remote_id);

        Some(handle)
    }

    pub fn get(&self, key: &ID) -> Option<SessionHandle> {
        lock!(self.inner).active.get(key).cloned()
    }

    pub fn contains(&self, key: &ID) -> bool {
        lock!(self.inner).active.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock!(self.inner).active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active sessions plus dials in flight.
    pub fn load(&self) -> usize {
        let inner = lock!(self.inner);
        inner.active.len() + inner.connecting.len()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<SessionHandle> = lock!(self.inner).active.values().cloned().collect();
        handles.sort_by_key(|h| h.peer.id());
        handles
    }

    pub fn broadcast(&self, message: Message) {
        for handle in self.handles() {
            handle.try_send(message.clone());
        }
    }

    pub fn close_all(&self) {
        for handle in self.handles() {
            handle.close();
        }
    }
}
