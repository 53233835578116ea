//! BEP10 extension handshake and the BEP9 ut_metadata messages carried in it.

use crate::ok_or_missing_field;
use anyhow::{anyhow, bail, Result};
use bendy::decoding::{Decoder, FromBencode, Object};
use bendy::encoding::{SingleItemEncoder, ToBencode};
use bytes::Bytes;

pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

const MSG_TYPE_REQUEST: u8 = 0;
const MSG_TYPE_DATA: u8 = 1;
const MSG_TYPE_REJECT: u8 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Id the sender wants ut_metadata messages tagged with, `None` if unsupported.
    pub ut_metadata: Option<u8>,
    pub metadata_size: Option<u64>,
}

struct ExtensionMap {
    ut_metadata: Option<u8>,
}

impl ToBencode for ExtensionMap {
    const MAX_DEPTH: usize = 1;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(id) = self.ut_metadata {
                e.emit_pair(b"ut_metadata", id)?;
            }
            Ok(())
        })
    }
}

impl ToBencode for ExtensionHandshake {
    const MAX_DEPTH: usize = 2;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(
                b"m",
                ExtensionMap {
                    ut_metadata: self.ut_metadata,
                },
            )?;
            if let Some(size) = self.metadata_size {
                e.emit_pair(b"metadata_size", size)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for ExtensionHandshake {
    const EXPECTED_RECURSION_DEPTH: usize = 4;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut ut_metadata = None;
        let mut metadata_size = None;

        let mut handshake = object.try_into_dictionary()?;
        while let Some(kv) = handshake.next_pair()? {
            match kv {
                (b"m", value) => {
                    let mut extensions = value.try_into_dictionary()?;
                    while let Some(ext) = extensions.next_pair()? {
                        if let (b"ut_metadata", value) = ext {
                            // 0 disables the extension, ids past u8 are unusable
                            ut_metadata = u8::try_from(u64::decode_bencode_object(value)?)
                                .ok()
                                .filter(|id| *id != 0);
                        }
                    }
                }
                (b"metadata_size", value) => {
                    metadata_size = Some(u64::decode_bencode_object(value)?);
                }
                _ => (),
            }
        }

        Ok(Self {
            ut_metadata,
            metadata_size,
        })
    }
}

impl ExtensionHandshake {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(Self::from_bencode(payload)?)
    }

    pub fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.to_bencode()?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request {
        piece: u32,
    },
    Data {
        piece: u32,
        total_size: u64,
        data: Bytes,
    },
    Reject {
        piece: u32,
    },
}

struct MetadataHeader {
    msg_type: u8,
    piece: u32,
    total_size: Option<u64>,
}

impl ToBencode for MetadataHeader {
    const MAX_DEPTH: usize = 1;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"msg_type", self.msg_type)?;
            e.emit_pair(b"piece", self.piece)?;
            if let Some(total_size) = self.total_size {
                e.emit_pair(b"total_size", total_size)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for MetadataHeader {
    const EXPECTED_RECURSION_DEPTH: usize = 2;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut msg_type = None;
        let mut piece = None;
        let mut total_size = None;

        let mut header = object.try_into_dictionary()?;
        while let Some(kv) = header.next_pair()? {
            match kv {
                (b"msg_type", value) => {
                    msg_type = Some(u8::decode_bencode_object(value)?);
                }
                (b"piece", value) => {
                    piece = Some(u32::decode_bencode_object(value)?);
                }
                (b"total_size", value) => {
                    total_size = Some(u64::decode_bencode_object(value)?);
                }
                _ => (),
            }
        }

        Ok(Self {
            msg_type: ok_or_missing_field!(msg_type)?,
            piece: ok_or_missing_field!(piece)?,
            total_size,
        })
    }
}

impl MetadataMessage {
    pub fn piece(&self) -> u32 {
        match self {
            Self::Request { piece } | Self::Data { piece, .. } | Self::Reject { piece } => *piece,
        }
    }

    /// The bencoded header is followed by the raw piece for `data` messages.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let header_bytes = Decoder::new(payload)
            .next_object()?
            .ok_or_else(|| anyhow!("empty ut_metadata message"))?
            .try_into_dictionary()?
            .into_raw()?;

        let header = MetadataHeader::from_bencode(header_bytes)?;
        let trailing = &payload[header_bytes.len()..];

        let message = match header.msg_type {
            MSG_TYPE_REQUEST => Self::Request {
                piece: header.piece,
            },
            MSG_TYPE_DATA => Self::Data {
                piece: header.piece,
                total_size: header
                    .total_size
                    .ok_or_else(|| anyhow!("ut_metadata data without total_size"))?,
                data: Bytes::copy_from_slice(trailing),
            },
            MSG_TYPE_REJECT => Self::Reject {
                piece: header.piece,
            },
            unknown => bail!("unknown ut_metadata msg_type {}", unknown),
        };

        Ok(message)
    }

    pub fn into_payload(self) -> Result<Vec<u8>> {
        let (header, data) = match self {
            Self::Request { piece } => (
                MetadataHeader {
                    msg_type: MSG_TYPE_REQUEST,
                    piece,
                    total_size: None,
                },
                None,
            ),
            Self::Data {
                piece,
                total_size,
                data,
            } => (
                MetadataHeader {
                    msg_type: MSG_TYPE_DATA,
                    piece,
                    total_size: Some(total_size),
                },
                Some(data),
            ),
            Self::Reject { piece } => (
                MetadataHeader {
                    msg_type: MSG_TYPE_REJECT,
                    piece,
                    total_size: None,
                },
                None,
            ),
        };

        let mut payload = header.to_bencode()?;
        if let Some(data) = data {
            payload.extend_from_slice(&data);
        }

        Ok(payload)
    }
}
