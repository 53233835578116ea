mod bitfield;
mod id;
mod no_size_bytes;

pub use bitfield::Bitfield;
pub use id::{ID, ID_LEN};
pub use no_size_bytes::NoSizeBytes;
