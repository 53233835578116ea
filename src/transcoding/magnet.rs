use crate::data_structures::ID;
use anyhow::{anyhow, bail, Result};
use std::str::FromStr;

const MAGNET_PREFIX: &str = "magnet:?";
const BTIH_PREFIX: &str = "urn:btih:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: ID,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl FromStr for MagnetLink {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some(query) = s.strip_prefix(MAGNET_PREFIX) else {
            bail!("not a magnet link: {}", s);
        };

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for param in query.split('&').filter(|p| !p.is_empty()) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };

            let value = urlencoding::decode(value)
                .map_err(|e| anyhow!("bad percent encoding in {}: {}", key, e))?
                .into_owned();

            match key {
                "xt" => {
                    if let Some(hex) = value.strip_prefix(BTIH_PREFIX) {
                        info_hash = Some(ID::from_hex(hex)?);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if !trackers.contains(&value) {
                        trackers.push(value);
                    }
                }
                _ => (),
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or_else(|| anyhow!("magnet link has no urn:btih xt"))?,
            display_name,
            trackers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MagnetLink;

    #[test]
    fn full_link() {
        let magnet: MagnetLink = "magnet:?xt=urn:btih:3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0&dn=ubuntu%2022.04&tr=https%3A%2F%2Ftorrent.ubuntu.com%2Fannounce&tr=http%3A%2F%2Fother.example%2Fannounce"
            .parse()
            .unwrap();

        assert_eq!(
            "3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0",
            magnet.info_hash.to_hex()
        );
        assert_eq!(Some("ubuntu 22.04".to_string()), magnet.display_name);
        assert_eq!(
            vec![
                "https://torrent.ubuntu.com/announce".to_string(),
                "http://other.example/announce".to_string()
            ],
            magnet.trackers
        );
    }

    #[test]
    fn only_xt() {
        let magnet: MagnetLink = "magnet:?xt=urn:btih:3B245504CF5F11BBDBE1201CEA6A6BF45AEE1BC0"
            .parse()
            .unwrap();

        assert_eq!(None, magnet.display_name);
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn missing_xt() {
        assert!("magnet:?dn=nothing".parse::<MagnetLink>().is_err());
        assert!("http://example.com".parse::<MagnetLink>().is_err());
        assert!("magnet:?xt=urn:btih:abcd".parse::<MagnetLink>().is_err());
    }
}
