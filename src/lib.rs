pub mod macros;

pub mod availability;
pub mod capped_growing_interval;
pub mod choke;
pub mod config;
pub mod constants;
pub mod data_structures;
pub mod metadata_exchange;
pub mod peers;
pub mod piece_store;
pub mod shutdown;
pub mod status;
pub mod torrent_manager;
pub mod tracker;
pub mod transcoding;

pub use config::{Config, SwarmConfig};
pub use status::{SwarmState, TorrentStatus};
pub use torrent_manager::{Source, TorrentHandle, TorrentManager};
