use crate::constants::{
    BLOCK_SIZE, DEFAULT_CHOKE_INTERVAL_SECS, DEFAULT_MAX_UNCHOKED,
    DEFAULT_OPTIMISTIC_ROTATION_TICKS, DEFAULT_PORT, HANDSHAKE_TIMEOUT_SECS, METADATA_PIECE_SIZE,
};
use clap::{ArgGroup, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)] // Read from `Cargo.toml`
#[clap(group(ArgGroup::new("source").required(true).args(["file", "magnet"])))]
pub struct Config {
    /// metainfo (.torrent) file
    #[clap(short, long, value_parser)]
    pub file: Option<PathBuf>,

    /// magnet:? link
    #[clap(short, long, value_parser)]
    pub magnet: Option<String>,

    /// where finished files are written, and read from with --seed
    #[clap(short, long, value_parser)]
    pub download_dir: Option<PathBuf>,

    #[clap(short, long, value_parser, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// regular unchoke slots, the optimistic one comes on top
    #[clap(long, value_parser, default_value_t = DEFAULT_MAX_UNCHOKED)]
    pub max_unchoked: usize,

    #[clap(long, value_parser, default_value_t = DEFAULT_OPTIMISTIC_ROTATION_TICKS)]
    pub optimistic_rotation_ticks: u32,

    #[clap(long, value_parser, default_value_t = DEFAULT_CHOKE_INTERVAL_SECS)]
    pub choke_interval_secs: u64,

    /// serve files already present in the download directory
    #[clap(long, value_parser)]
    pub seed: bool,

    /// peers to dial besides whatever trackers return
    #[clap(long = "peer", value_parser)]
    pub peers: Vec<SocketAddr>,
}

impl Config {
    pub fn new() -> Config {
        Config::parse()
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(|| {
            home::home_dir()
                .map(|home| home.join("Downloads"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

/// Knobs of one torrent's engine.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub download_dir: PathBuf,
    pub port: u16,
    pub max_unchoked: usize,
    pub optimistic_rotation_ticks: u32,
    pub choke_interval: Duration,
    pub seed: bool,
    pub bootstrap_peers: Vec<SocketAddr>,
    pub block_size: usize,
    pub metadata_piece_size: usize,
    /// How long a selected piece waits for any holder to unchoke us.
    pub unchoke_wait: Duration,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_peers: usize,
    /// Requests kept in flight per peer.
    pub pipeline_depth: usize,
    /// Also listen on `[::]` next to `0.0.0.0`.
    pub listen_v6: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            port: DEFAULT_PORT,
            max_unchoked: DEFAULT_MAX_UNCHOKED,
            optimistic_rotation_ticks: DEFAULT_OPTIMISTIC_ROTATION_TICKS,
            choke_interval: Duration::from_secs(DEFAULT_CHOKE_INTERVAL_SECS),
            seed: false,
            bootstrap_peers: Vec::new(),
            block_size: BLOCK_SIZE,
            metadata_piece_size: METADATA_PIECE_SIZE,
            unchoke_wait: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            max_peers: 50,
            pipeline_depth: 16,
            listen_v6: true,
        }
    }
}

impl From<&Config> for SwarmConfig {
    fn from(config: &Config) -> Self {
        Self {
            download_dir: config.download_dir(),
            port: config.port,
            max_unchoked: config.max_unchoked,
            optimistic_rotation_ticks: config.optimistic_rotation_ticks,
            choke_interval: Duration::from_secs(config.choke_interval_secs),
            seed: config.seed,
            bootstrap_peers: config.peers.clone(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, SwarmConfig};
    use clap::Parser;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn magnet_with_overrides() {
        let config = Config::try_parse_from([
            "piecemeal",
            "--magnet",
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a",
            "--download-dir",
            "/tmp/x",
            "--max-unchoked",
            "2",
            "--choke-interval-secs",
            "5",
            "--peer",
            "127.0.0.1:6882",
            "--peer",
            "[::1]:6883",
        ])
        .unwrap();

        let swarm = SwarmConfig::from(&config);

        assert_eq!(PathBuf::from("/tmp/x"), swarm.download_dir);
        assert_eq!(2, swarm.max_unchoked);
        assert_eq!(3, swarm.optimistic_rotation_ticks);
        assert_eq!(Duration::from_secs(5), swarm.choke_interval);
        assert_eq!(6881, swarm.port);
        assert_eq!(2, swarm.bootstrap_peers.len());
        assert!(!swarm.seed);
    }

    #[test]
    fn exactly_one_source() {
        assert!(Config::try_parse_from(["piecemeal"]).is_err());
        assert!(Config::try_parse_from([
            "piecemeal",
            "--file",
            "a.torrent",
            "--magnet",
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a",
        ])
        .is_err());
        assert!(Config::try_parse_from(["piecemeal", "-f", "a.torrent", "--seed"]).is_ok());
    }
}
