use crate::constants::{HANDSHAKE_LENGTH_FOR_BITTORRENT_PROTOCOL, PSTR, PSTRLEN};
use crate::data_structures::{ID, ID_LEN};
use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RESERVED_START: usize = 1 + PSTRLEN as usize;
const INFO_HASH_START: usize = RESERVED_START + 8;
const PEER_ID_START: usize = INFO_HASH_START + ID_LEN;

const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: ID,
    pub peer_id: ID,
}

impl Handshake {
    /// Our own handshake always advertises BEP10.
    pub fn new(info_hash: &ID, peer_id: &ID) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;

        Self {
            reserved,
            info_hash: info_hash.to_owned(),
            peer_id: peer_id.to_owned(),
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT > 0
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LENGTH_FOR_BITTORRENT_PROTOCOL] {
        let mut rv = [0u8; HANDSHAKE_LENGTH_FOR_BITTORRENT_PROTOCOL];

        rv[0] = PSTRLEN;
        rv[1..RESERVED_START].copy_from_slice(PSTR);
        rv[RESERVED_START..INFO_HASH_START].copy_from_slice(&self.reserved);
        rv[INFO_HASH_START..PEER_ID_START].copy_from_slice(self.info_hash.as_byte_ref());
        rv[PEER_ID_START..].copy_from_slice(self.peer_id.as_byte_ref());

        rv
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HANDSHAKE_LENGTH_FOR_BITTORRENT_PROTOCOL {
            bail!(
                "handshake should be {} bytes long, got {}",
                HANDSHAKE_LENGTH_FOR_BITTORRENT_PROTOCOL,
                buf.len()
            );
        }

        let pstrlen = buf[0];
        let pstr = &buf[1..RESERVED_START];

        if pstrlen != PSTRLEN || pstr != PSTR {
            bail!("unsupported protocol");
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[RESERVED_START..INFO_HASH_START]);

        Ok(Self {
            reserved,
            info_hash: ID::try_from(&buf[INFO_HASH_START..PEER_ID_START])?,
            peer_id: ID::try_from(&buf[PEER_ID_START..])?,
        })
    }
}

async fn read_handshake<S>(stream: &mut S) -> Result<Handshake>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LENGTH_FOR_BITTORRENT_PROTOCOL];
    stream.read_exact(&mut buf).await?;

    Handshake::from_bytes(&buf)
}

/// Sends ours first, then expects the same torrent back.
pub async fn initiate_handshake<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.to_bytes()).await?;

    let theirs = read_handshake(stream).await?;

    if theirs.info_hash != ours.info_hash {
        bail!(
            "info hash mismatch, expected {:?} got {:?}",
            ours.info_hash,
            theirs.info_hash
        );
    }

    Ok(theirs)
}

/// Reads the initiator's handshake and answers only if it names our torrent.
pub async fn accept_handshake<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let theirs = read_handshake(stream).await?;

    if theirs.info_hash != ours.info_hash {
        bail!(
            "peer asked for {:?}, we serve {:?}",
            theirs.info_hash,
            ours.info_hash
        );
    }

    stream.write_all(&ours.to_bytes()).await?;

    Ok(theirs)
}
