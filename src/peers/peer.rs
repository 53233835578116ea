use crate::data_structures::ID;
use crate::transcoding::socketaddr_from_compact_bytes;
use anyhow::Result;
use std::fmt;
use std::net::SocketAddr;

/// A remote endpoint and the key its session is registered under.
///
/// The key is derived from the address so an outbound connection and the
/// tracker's peer list agree on identity before any handshake happens.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Peer {
    id: ID,
    addr: SocketAddr,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            id: ID::from_addr(&addr),
            addr,
        }
    }

    pub fn from_compact_bytes(buff: &[u8]) -> Result<Self> {
        Ok(Self::new(socketaddr_from_compact_bytes(buff)?))
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn addr(&self) -> &SocketAddr {
        &self.addr
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}
