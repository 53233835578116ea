use crate::data_structures::ID;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct InnerPCI {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    remote_id: Option<ID>,
    supports_extensions: bool,
    ut_metadata: Option<u8>,
    metadata_size: Option<u64>,
    metadata_rejected: bool,
}

/// Choke/interest flags and extension capabilities of one session, shared
/// between the session task and whoever drives requests through it.
#[derive(Clone, Debug)]
pub struct PeerConnectionInfo {
    data: Arc<RwLock<InnerPCI>>,
}

impl Default for PeerConnectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConnectionInfo {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(InnerPCI {
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
                remote_id: None,
                supports_extensions: false,
                ut_metadata: None,
                metadata_size: None,
                metadata_rejected: false,
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, InnerPCI> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InnerPCI> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn am_choking(&self) -> bool {
        self.read().am_choking
    }
    pub fn set_am_choking(&self, v: bool) {
        self.write().am_choking = v
    }

    pub fn am_interested(&self) -> bool {
        self.read().am_interested
    }
    pub fn set_am_interested(&self, v: bool) {
        self.write().am_interested = v
    }

    pub fn peer_choking(&self) -> bool {
        self.read().peer_choking
    }
    pub fn set_peer_choking(&self, v: bool) {
        self.write().peer_choking = v
    }

    pub fn peer_interested(&self) -> bool {
        self.read().peer_interested
    }
    pub fn set_peer_interested(&self, v: bool) {
        self.write().peer_interested = v
    }

    pub fn remote_id(&self) -> Option<ID> {
        self.read().remote_id
    }
    pub fn set_remote_id(&self, id: ID) {
        self.write().remote_id = Some(id)
    }

    pub fn supports_extensions(&self) -> bool {
        self.read().supports_extensions
    }
    pub fn set_supports_extensions(&self, v: bool) {
        self.write().supports_extensions = v
    }

    pub fn ut_metadata(&self) -> Option<u8> {
        self.read().ut_metadata
    }

    pub fn set_extension_handshake(&self, ut_metadata: Option<u8>, metadata_size: Option<u64>) {
        let mut data = self.write();
        data.ut_metadata = ut_metadata;
        data.metadata_size = metadata_size;
    }

    pub fn set_metadata_rejected(&self) {
        self.write().metadata_rejected = true
    }

    /// Peer speaks ut_metadata, told us the size and never rejected us.
    pub fn is_metadata_source(&self) -> bool {
        let data = self.read();
        data.supports_extensions
            && data.ut_metadata.is_some()
            && data.metadata_size.is_some()
            && !data.metadata_rejected
    }
}
