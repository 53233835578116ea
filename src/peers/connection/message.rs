use crate::data_structures::NoSizeBytes;
use crate::piece_store::BlockRequest;
use crate::u32_from_be_slice;
use anyhow::{bail, Result};
use bincode::Options;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

pub const BYTES_IN_LEN_PREFIX: usize = 4;
const ID_IDX: usize = 4;
const BITFIELD_START: usize = 5;
const BLOCK_START: usize = 13;
const EXTENDED_PAYLOAD_START: usize = 6;
const FIRST_NUM_START: usize = 5;
const SECOND_NUM_START: usize = 9;
const THIRD_NUM_START: usize = 13;

const CHOKE_ID: u8 = 0;
const UNCHOKE_ID: u8 = 1;
const INTERESTED_ID: u8 = 2;
const NOT_INTERESTED_ID: u8 = 3;
const HAVE_ID: u8 = 4;
const BITFIELD_ID: u8 = 5;
const REQUEST_ID: u8 = 6;
const PIECE_ID: u8 = 7;
const CANCEL_ID: u8 = 8;
const PORT_ID: u8 = 9;
const EXTENDED_ID: u8 = 20;

const CHOKE_LEN: u32 = 1;
const UNCHOKE_LEN: u32 = 1;
const INTERESTED_LEN: u32 = 1;
const NOT_INTERESTED_LEN: u32 = 1;
const HAVE_LEN: u32 = 5;
const BITFIELD_LEN: u32 = 1;
const REQUEST_LEN: u32 = 13;
const PIECE_LEN: u32 = 9;
const CANCEL_LEN: u32 = 13;
const PORT_LEN: u32 = 3;
const EXTENDED_LEN: u32 = 2;

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(NoSizeBytes),
    Request(Request),
    Piece(Piece),
    Cancel(Request),
    Port(u16),
    Extended(Extended),
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct Piece {
    pub index: u32,
    pub begin: u32,
    pub block: NoSizeBytes,
}

/// BEP10 envelope. `id` 0 is the extension handshake, anything else is the
/// message id the receiver advertised for that extension.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct Extended {
    pub id: u8,
    pub payload: NoSizeBytes,
}

impl Message {
    /// Length prefix of a frame, not counting the prefix itself.
    pub fn len(buf: &[u8]) -> usize {
        u32_from_be_slice!(buf[0..BYTES_IN_LEN_PREFIX]) as usize
    }

    /// Decodes one complete frame, length prefix included.
    pub fn from_buf(buf: &[u8]) -> Result<Self> {
        if buf.len() < BYTES_IN_LEN_PREFIX {
            bail!("frame shorter than its length prefix ({} bytes)", buf.len());
        }

        let len = Self::len(buf) + BYTES_IN_LEN_PREFIX;

        if buf.len() < len {
            bail!(
                "message len ({len}) is more than provided buffer {}",
                buf.len()
            );
        }

        if len == BYTES_IN_LEN_PREFIX {
            return Ok(Message::KeepAlive);
        }

        let id = buf[ID_IDX];
        let payload_len = len - BITFIELD_START;

        let expect_payload = |expected: usize| -> Result<()> {
            if payload_len != expected {
                bail!(
                    "message id {} expects {} payload bytes, got {}",
                    id,
                    expected,
                    payload_len
                );
            }
            Ok(())
        };

        let message = match id {
            CHOKE_ID => {
                expect_payload(0)?;
                Message::Choke
            }
            UNCHOKE_ID => {
                expect_payload(0)?;
                Message::Unchoke
            }
            INTERESTED_ID => {
                expect_payload(0)?;
                Message::Interested
            }
            NOT_INTERESTED_ID => {
                expect_payload(0)?;
                Message::NotInterested
            }
            HAVE_ID => {
                expect_payload(4)?;
                Message::Have(u32_from_be_slice!(buf[FIRST_NUM_START..]))
            }
            BITFIELD_ID => Message::Bitfield(NoSizeBytes::from(&buf[BITFIELD_START..len])),
            REQUEST_ID => {
                expect_payload(12)?;
                Message::Request(Request::from_payload(buf))
            }
            PIECE_ID => {
                if payload_len < 8 {
                    bail!("piece message without index and begin");
                }
                Message::Piece(Piece::new(
                    u32_from_be_slice!(buf[FIRST_NUM_START..]),
                    u32_from_be_slice!(buf[SECOND_NUM_START..]),
                    &buf[BLOCK_START..len],
                ))
            }
            CANCEL_ID => {
                expect_payload(12)?;
                Message::Cancel(Request::from_payload(buf))
            }
            PORT_ID => {
                expect_payload(2)?;
                Message::Port(
                    ((buf[FIRST_NUM_START] as u16) << 8) + (buf[FIRST_NUM_START + 1] as u16),
                )
            }
            EXTENDED_ID => {
                if payload_len < 1 {
                    bail!("extended message without extension id");
                }
                Message::Extended(Extended {
                    id: buf[FIRST_NUM_START],
                    payload: NoSizeBytes::from(&buf[EXTENDED_PAYLOAD_START..len]),
                })
            }
            unsupported => bail!("unsupported message id {}", unsupported),
        };

        Ok(message)
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        Ok(bincode::DefaultOptions::new()
            .with_big_endian()
            .with_fixint_encoding()
            .serialize(&self)?)
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Message::KeepAlive => serializer.serialize_u32(0),
            Message::Choke => {
                let mut tup = serializer.serialize_tuple(2)?;
                tup.serialize_element(&CHOKE_LEN)?;
                tup.serialize_element(&CHOKE_ID)?;
                tup.end()
            }
            Message::Unchoke => {
                let mut tup = serializer.serialize_tuple(2)?;
                tup.serialize_element(&UNCHOKE_LEN)?;
                tup.serialize_element(&UNCHOKE_ID)?;
                tup.end()
            }
            Message::Interested => {
                let mut tup = serializer.serialize_tuple(2)?;
                tup.serialize_element(&INTERESTED_LEN)?;
                tup.serialize_element(&INTERESTED_ID)?;
                tup.end()
            }
            Message::NotInterested => {
                let mut tup = serializer.serialize_tuple(2)?;
                tup.serialize_element(&NOT_INTERESTED_LEN)?;
                tup.serialize_element(&NOT_INTERESTED_ID)?;
                tup.end()
            }
            Message::Have(piece_index) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&HAVE_LEN)?;
                tup.serialize_element(&HAVE_ID)?;
                tup.serialize_element(&piece_index)?;
                tup.end()
            }
            Message::Bitfield(bitfield) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&(BITFIELD_LEN + bitfield.len() as u32))?;
                tup.serialize_element(&BITFIELD_ID)?;
                tup.serialize_element(bitfield)?;
                tup.end()
            }
            Message::Request(request) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&REQUEST_LEN)?;
                tup.serialize_element(&REQUEST_ID)?;
                tup.serialize_element(&request)?;
                tup.end()
            }
            Message::Piece(piece) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&(PIECE_LEN + piece.len() as u32))?;
                tup.serialize_element(&PIECE_ID)?;
                tup.serialize_element(&piece)?;
                tup.end()
            }
            Message::Cancel(request) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&CANCEL_LEN)?;
                tup.serialize_element(&CANCEL_ID)?;
                tup.serialize_element(&request)?;
                tup.end()
            }
            Message::Port(listen_port) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&PORT_LEN)?;
                tup.serialize_element(&PORT_ID)?;
                tup.serialize_element(listen_port)?;
                tup.end()
            }
            Message::Extended(extended) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&(EXTENDED_LEN + extended.payload.len() as u32))?;
                tup.serialize_element(&EXTENDED_ID)?;
                tup.serialize_element(&extended)?;
                tup.end()
            }
        }
    }
}

impl Request {
    fn from_payload(buf: &[u8]) -> Self {
        Self {
            index: u32_from_be_slice!(buf[FIRST_NUM_START..]),
            begin: u32_from_be_slice!(buf[SECOND_NUM_START..]),
            length: u32_from_be_slice!(buf[THIRD_NUM_START..]),
        }
    }
}

impl From<&BlockRequest> for Request {
    fn from(block: &BlockRequest) -> Self {
        Self {
            index: block.piece as u32,
            begin: block.begin as u32,
            length: block.length as u32,
        }
    }
}

impl Piece {
    pub fn new(index: u32, begin: u32, block: &[u8]) -> Piece {
        Piece {
            index,
            begin,
            block: NoSizeBytes::from(block),
        }
    }

    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Extended, Message, Piece, Request};
    use crate::data_structures::NoSizeBytes;

    fn long_buf_from_message_slice(raw_message: &[u8]) -> [u8; 1 << 6] {
        let mut buf = [0u8; 1 << 6];
        buf[..raw_message.len()].copy_from_slice(raw_message);
        buf
    }

    fn test_message_ser_de(raw_message: &[u8], expected_message: Message) {
        let buf = long_buf_from_message_slice(raw_message);

        let message = Message::from_buf(&buf).unwrap();

        assert_eq!(expected_message, message);

        let bytes = message.into_bytes().unwrap();

        assert_eq!(&buf[..raw_message.len()], &bytes);
    }

    #[test]
    fn keep_alive() {
        let raw_message = [0, 0, 0, 0];
        let message = Message::KeepAlive;
        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn choke() {
        let raw_message = [0, 0, 0, 1, 0];
        let message = Message::Choke;
        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn unchoke() {
        let raw_message = [0, 0, 0, 1, 1];
        let message = Message::Unchoke;
        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn interested() {
        let raw_message = [0, 0, 0, 1, 2];
        let message = Message::Interested;
        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn not_interested() {
        let raw_message = [0, 0, 0, 1, 3];
        let message = Message::NotInterested;
        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn have() {
        let piece_index: u32 = 726049813;

        let mut raw_message = [0, 0, 0, 5, 4, 0, 0, 0, 0];
        raw_message[5..9].copy_from_slice(&piece_index.to_be_bytes());

        let message = Message::Have(piece_index);

        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn bitfield() {
        let raw_message = [0, 0, 0, 8, 5, 23, 113, 254, 203, 0, 17, 224];

        let bitfield = &raw_message[5..];

        let message = Message::Bitfield(NoSizeBytes::from(bitfield));

        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn request() {
        let index: u32 = 726049813;
        let begin: u32 = 3456;
        let length: u32 = 11166679;

        let mut raw_message = [0, 0, 0, 13, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        raw_message[5..9].copy_from_slice(&index.to_be_bytes());
        raw_message[9..13].copy_from_slice(&begin.to_be_bytes());
        raw_message[13..17].copy_from_slice(&length.to_be_bytes());

        let message = Message::Request(Request {
            index,
            begin,
            length,
        });

        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn piece() {
        let index: u32 = 726049813;
        let begin: u32 = 3456;

        let mut raw_message = [
            0, 0, 0, 20, 7, 0, 0, 0, 0, 0, 0, 0, 0, 247, 251, 239, 152, 196, 66, 34, 33, 90, 29, 97,
        ];
        raw_message[5..9].copy_from_slice(&index.to_be_bytes());
        raw_message[9..13].copy_from_slice(&begin.to_be_bytes());

        let message = Message::Piece(Piece::new(index, begin, &raw_message[13..]));

        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn cancel() {
        let index: u32 = 726049813;
        let begin: u32 = 3456;
        let length: u32 = 11166679;

        let mut raw_message = [0, 0, 0, 13, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        raw_message[5..9].copy_from_slice(&index.to_be_bytes());
        raw_message[9..13].copy_from_slice(&begin.to_be_bytes());
        raw_message[13..17].copy_from_slice(&length.to_be_bytes());

        let message = Message::Cancel(Request {
            index,
            begin,
            length,
        });

        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn port() {
        let piece_index = 45678u16;
        let left = (piece_index >> 8) as u8;
        let right = (piece_index % (1 << 8)) as u8;

        let raw_message = [0, 0, 0, 3, 9, left, right];

        let message = Message::Port(piece_index);

        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn extended() {
        let mut raw_message = vec![0, 0, 0, 0, 20, 1];
        raw_message.extend_from_slice(b"d8:msg_typei0e5:piecei0ee");
        let len = (raw_message.len() - 4) as u32;
        raw_message[..4].copy_from_slice(&len.to_be_bytes());

        let message = Message::Extended(Extended {
            id: 1,
            payload: NoSizeBytes::from(&b"d8:msg_typei0e5:piecei0ee"[..]),
        });

        test_message_ser_de(&raw_message, message);
    }

    #[test]
    fn incomplete_message() {
        let raw_message = [
            0, 0, 0, 69, 7, 1, 2, 3, 4, 5, 6, 7, 8, 247, 251, 239, 152, 196, 66, 34, 33, 90,
        ];

        let buf = long_buf_from_message_slice(&raw_message);

        assert!(Message::from_buf(&buf).is_err());
    }

    #[test]
    fn malformed_messages() {
        assert!(Message::from_buf(&[0, 0, 0, 2, 4, 1]).is_err());
        assert!(Message::from_buf(&[0, 0, 0, 2, 0, 0]).is_err());
        assert!(Message::from_buf(&[0, 0, 0, 1, 42]).is_err());
        assert!(Message::from_buf(&[0, 0, 0, 1, 20]).is_err());
        assert!(Message::from_buf(&[0, 0]).is_err());
    }
}
