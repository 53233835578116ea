use anyhow::{bail, Result};
use openssl::sha;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use std::fmt;
use std::net::SocketAddr;

pub const ID_LEN: usize = 20;

const CLIENT_PREFIX: &[u8] = b"-PM0100-";

/// 20 byte identifier: info hashes, piece hashes and peer ids.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ID([u8; ID_LEN]);

impl ID {
    pub fn new(id_array: [u8; ID_LEN]) -> Self {
        Self(id_array)
    }

    /// Azureus-style peer id, client prefix followed by random alphanumerics.
    pub fn generate_peer_id() -> Self {
        let mut id = [0u8; ID_LEN];
        id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);

        for (byte, c) in id[CLIENT_PREFIX.len()..]
            .iter_mut()
            .zip(thread_rng().sample_iter(&Alphanumeric))
        {
            *byte = c;
        }

        Self(id)
    }

    /// Stable key for a peer we only know by address.
    pub fn from_addr(addr: &SocketAddr) -> Self {
        Self::hash(format!("{}:{}", addr.ip(), addr.port()).as_bytes())
    }

    pub fn hash(data: &[u8]) -> Self {
        Self(sha::sha1(data))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)?;
        Self::try_from(raw.as_slice())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_byte_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl TryFrom<&[u8]> for ID {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != ID_LEN {
            bail!("id must be {} bytes, got {}", ID_LEN, value.len());
        }

        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(value);

        Ok(Self(id))
    }
}

impl Default for ID {
    fn default() -> Self {
        Self::new(rand::random())
    }
}

impl fmt::Debug for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::{ID, ID_LEN};
    use std::net::SocketAddr;

    #[test]
    fn create() {
        let arr: [u8; ID_LEN] = rand::random();

        let id = ID::new(arr.to_owned());

        for (i, x) in arr.iter().enumerate() {
            assert_eq!(*x, id.0[i]);
        }
    }

    #[test]
    fn peer_id_has_prefix() {
        let id = ID::generate_peer_id();

        assert_eq!(b"-PM0100-", &id.as_byte_ref()[..8]);
        assert!(id.as_byte_ref()[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(id, ID::generate_peer_id());
    }

    #[test]
    fn from_addr_is_deterministic() {
        let addr: SocketAddr = "10.0.0.7:6881".parse().unwrap();
        let other: SocketAddr = "10.0.0.7:6882".parse().unwrap();

        assert_eq!(ID::from_addr(&addr), ID::from_addr(&addr));
        assert_ne!(ID::from_addr(&addr), ID::from_addr(&other));
        assert_eq!(ID::hash(b"10.0.0.7:6881"), ID::from_addr(&addr));
    }

    #[test]
    fn hex() {
        let hex = "3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0";
        let id = ID::from_hex(hex).unwrap();

        assert_eq!(0x3b, id.as_byte_ref()[0]);
        assert_eq!(0xc0, id.as_byte_ref()[19]);
        assert_eq!(hex, id.to_hex());
        assert!(ID::from_hex("3b24").is_err());
        assert!(ID::from_hex("zz245504cf5f11bbdbe1201cea6a6bf45aee1bc0").is_err());
    }

    #[test]
    fn sha1() {
        assert_eq!(
            "a9993e364706816aba3e25717850c26c9cd0d89d",
            ID::hash(b"abc").to_hex()
        );
    }

    #[test]
    fn try_from_slice() {
        assert!(ID::try_from(&[0u8; 19][..]).is_err());
        assert_eq!(ID::new([7; ID_LEN]), ID::try_from(&[7u8; 20][..]).unwrap());
    }
}
