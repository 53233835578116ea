pub const PSTRLEN: u8 = 19;
pub const PSTR: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LENGTH_FOR_BITTORRENT_PROTOCOL: usize = 68;

pub const KEEP_ALIVE_INTERVAL_SECS: u64 = 100;
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

pub const BLOCK_SIZE: usize = 1 << 14;
pub const MAX_BLOCK_REQUEST: usize = 1 << 17;
pub const MAX_MESSAGE_BYTES: usize = 1 << 18;

/// BEP9 fixes metadata pieces at 16 KiB.
pub const METADATA_PIECE_SIZE: usize = 1 << 14;
pub const MAX_METADATA_SIZE: usize = 1 << 24;

/// Id we advertise for ut_metadata in our extension handshake.
pub const LOCAL_UT_METADATA_ID: u8 = 1;

pub const DEFAULT_PORT: u16 = 6881;
pub const DEFAULT_MAX_UNCHOKED: usize = 4;
pub const DEFAULT_OPTIMISTIC_ROTATION_TICKS: u32 = 3;
pub const DEFAULT_CHOKE_INTERVAL_SECS: u64 = 10;
