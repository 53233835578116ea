use crate::data_structures::{ID, ID_LEN};
use crate::{ok_or_missing_field, unsigned_ceil_div};
use anyhow::{anyhow, Result};
use bendy::decoding::{Decoder, FromBencode, Object};
use bendy::encoding::{AsString, SingleItemEncoder, ToBencode};
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Single { length: u64 },
    Multi { files: Vec<File> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<ID>,
    pub mode: Mode,
}

/// Resolved torrent descriptor. Immutable once built.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub info: Info,
    pub info_hash: ID,
    /// Bencoded info dictionary exactly as hashed, served over ut_metadata.
    pub info_bytes: Bytes,
    pub announce: Vec<String>,
}

impl Torrent {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let buffer = std::fs::read(path.as_ref())
            .map_err(|e| anyhow!("can't read {}: {}", path.as_ref().display(), e))?;

        Self::from_buffer(&buffer)
    }

    pub fn from_buffer(buffer: &[u8]) -> Result<Self> {
        Ok(Self::from_bencode(buffer)?)
    }

    /// Builds a torrent from a bencoded info dictionary, e.g. one assembled
    /// over ut_metadata. The info hash is computed over `info_bytes` as given.
    pub fn from_info_bytes(info_bytes: &[u8], announce: Vec<String>) -> Result<Self> {
        let mut decoder = Decoder::new(info_bytes);
        let object = decoder
            .next_object()?
            .ok_or_else(|| anyhow!("empty info dictionary"))?;

        Ok(Self {
            info: Info::decode_bencode_object(object)?,
            info_hash: ID::hash(info_bytes),
            info_bytes: Bytes::copy_from_slice(info_bytes),
            announce,
        })
    }

    pub fn from_info(info: &Info, announce: Vec<String>) -> Result<Self> {
        let info_bytes = info.to_bencode()?;
        Self::from_info_bytes(&info_bytes, announce)
    }

    pub fn metadata_size(&self) -> usize {
        self.info_bytes.len()
    }
}

impl FromBencode for File {
    const EXPECTED_RECURSION_DEPTH: usize = 10;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut path = None;
        let mut length = None;

        let mut file = object.try_into_dictionary()?;
        while let Some(kv) = file.next_pair()? {
            match kv {
                (b"path", value) => {
                    path = Some(Vec::<String>::decode_bencode_object(value)?);
                }
                (b"length", value) => {
                    length = Some(u64::decode_bencode_object(value)?);
                }
                _ => (),
            }
        }

        let path: Vec<String> = ok_or_missing_field!(path)?;

        if path.is_empty() || path.iter().any(|segment| !is_safe_segment(segment)) {
            return Err(bendy::decoding::Error::missing_field(format!(
                "File::path must be relative segments, got {:?}",
                path
            )));
        }

        Ok(File {
            path,
            length: ok_or_missing_field!(length)?,
        })
    }
}

impl ToBencode for File {
    const MAX_DEPTH: usize = 2;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", self.path.clone())
        })
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('/')
        && !segment.contains('\\')
}

impl Info {
    pub fn length(&self) -> u64 {
        match &self.mode {
            Mode::Single { length } => *length,
            Mode::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Every piece is `piece_length` long except the last one.
    pub fn piece_size(&self, idx: usize) -> usize {
        let start = idx as u64 * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.length());

        end.saturating_sub(start) as usize
    }

    pub fn piece_hash(&self, idx: usize) -> Option<&ID> {
        self.pieces.get(idx)
    }

    /// Files in stream order. Single file mode is a one element list.
    pub fn files(&self) -> Vec<File> {
        match &self.mode {
            Mode::Single { length } => vec![File {
                path: vec![self.name.clone()],
                length: *length,
            }],
            Mode::Multi { files } => files.clone(),
        }
    }

    /// Where each of `files()` lands under `target`.
    pub fn file_paths(&self, target: &Path) -> Vec<PathBuf> {
        let root = match &self.mode {
            Mode::Single { .. } => target.to_path_buf(),
            Mode::Multi { .. } => target.join(&self.name),
        };

        self.files()
            .iter()
            .map(|file| file.path.iter().fold(root.clone(), |p, s| p.join(s)))
            .collect()
    }

    fn pieces_as_bytes(&self) -> Vec<u8> {
        self.pieces
            .iter()
            .flat_map(|id| id.as_byte_ref().iter().copied())
            .collect()
    }
}

fn deserialize_pieces(raw: Vec<u8>) -> Result<Vec<ID>, bendy::decoding::Error> {
    if raw.is_empty() || raw.len() % ID_LEN > 0 {
        return Err(bendy::decoding::Error::missing_field(format!(
            "Info::pieces must be 20-byte SHA1 hash values but it has len={}",
            raw.len()
        )));
    }

    raw.chunks_exact(ID_LEN)
        .map(|chunk| {
            ID::try_from(chunk).map_err(|e| bendy::decoding::Error::missing_field(e.to_string()))
        })
        .collect()
}

impl FromBencode for Info {
    const EXPECTED_RECURSION_DEPTH: usize = 10;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut piece_length = None;
        let mut pieces = None;
        let mut length = None;
        let mut name = None;
        let mut files = None;

        let mut info = object.try_into_dictionary()?;
        while let Some(kv) = info.next_pair()? {
            match kv {
                (b"name", value) => {
                    name = Some(String::decode_bencode_object(value)?);
                }
                (b"pieces", value) => {
                    pieces = {
                        let raw = AsString::decode_bencode_object(value)?.0;
                        Some(deserialize_pieces(raw)?)
                    };
                }
                (b"length", value) => {
                    length = Some(u64::decode_bencode_object(value)?);
                }
                (b"piece length", value) => {
                    piece_length = Some(u64::decode_bencode_object(value)?);
                }
                (b"files", value) => {
                    files = Some(Vec::<File>::decode_bencode_object(value)?);
                }
                _ => (),
            }
        }

        let mode = match (length, files) {
            (Some(length), None) => Mode::Single { length },
            (None, Some(files)) => Mode::Multi { files },
            _ => {
                return Err(bendy::decoding::Error::missing_field(
                    "exactly one of length and files",
                ))
            }
        };

        let name: String = ok_or_missing_field!(name)?;
        if !is_safe_segment(&name) {
            return Err(bendy::decoding::Error::missing_field(format!(
                "Info::name must be a single path segment, got {:?}",
                name
            )));
        }

        let piece_length: u64 = ok_or_missing_field!(piece_length)?;
        if piece_length == 0 {
            return Err(bendy::decoding::Error::missing_field("non-zero piece length"));
        }

        let info = Info {
            piece_length,
            pieces: ok_or_missing_field!(pieces)?,
            name,
            mode,
        };

        let expected_pieces = unsigned_ceil_div!(info.length(), info.piece_length);
        if info.pieces.len() as u64 != expected_pieces {
            return Err(bendy::decoding::Error::missing_field(format!(
                "Info::pieces holds {} hashes but length needs {}",
                info.pieces.len(),
                expected_pieces
            )));
        }

        Ok(info)
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            match &self.mode {
                Mode::Multi { files } => e.emit_pair(b"files", files.clone())?,
                Mode::Single { length } => e.emit_pair(b"length", *length)?,
            }
            e.emit_pair(b"name", self.name.clone())?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(self.pieces_as_bytes()))
        })
    }
}

impl FromBencode for Torrent {
    const EXPECTED_RECURSION_DEPTH: usize = 10;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut info = None;
        let mut announce = Vec::new();

        let mut torrent = object.try_into_dictionary()?;
        while let Some(kv) = torrent.next_pair()? {
            match kv {
                (b"info", value) => {
                    let bytes = value.try_into_dictionary()?.into_raw()?;

                    let mut decoder = Decoder::new(bytes);
                    let obj = decoder.next_object()?;

                    if let Some(object) = obj {
                        info = Some((Info::decode_bencode_object(object)?, bytes.to_vec()));
                    }
                }
                (b"announce", value) => {
                    push_tracker(&mut announce, String::decode_bencode_object(value)?);
                }
                (b"announce-list", value) => {
                    let list = Vec::<Vec<String>>::decode_bencode_object(value)?;
                    for tier in list {
                        for url in tier {
                            push_tracker(&mut announce, url);
                        }
                    }
                }
                _ => (),
            }
        }

        let (info, info_bytes) = ok_or_missing_field!(info)?;

        Ok(Torrent {
            info,
            info_hash: ID::hash(&info_bytes),
            info_bytes: Bytes::from(info_bytes),
            announce,
        })
    }
}

/// Only HTTP(S) trackers are spoken to.
fn push_tracker(announce: &mut Vec<String>, url: String) {
    if (url.starts_with("http://") || url.starts_with("https://")) && !announce.contains(&url) {
        announce.push(url);
    }
}

impl fmt::Display for Torrent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut formatted_files = Vec::new();

        if let Mode::Multi { files } = &self.info.mode {
            for (i, file) in files.iter().enumerate() {
                formatted_files.push(format!(
                    "file_{:?} length:\t{}\tpath:\t{:?}\n",
                    i, file.length, file.path
                ));
            }
        };

        write!(
            f,
            "info hash:\t{}\n\
            announce:\t{:?}\n\
            name:\t\t{}\n\
            piece length:\t{:?}\n\
            piece count:\t{:?}\n\
            length:\t\t{:?}\n\
            {}",
            self.info_hash.to_hex(),
            self.announce,
            self.info.name,
            self.info.piece_length,
            self.info.piece_count(),
            self.info.length(),
            formatted_files.join(""),
        )
    }
}
