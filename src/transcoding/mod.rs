pub mod magnet;
pub mod metainfo;

use anyhow::{bail, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const COMPACT_SOCKADDR_V4_LEN: usize = 6;
pub const COMPACT_SOCKADDR_V6_LEN: usize = 18;

pub fn socketaddr_from_compact_bytes(buf: &[u8]) -> Result<SocketAddr> {
    match buf.len() {
        COMPACT_SOCKADDR_V4_LEN => Ok(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3])),
            ((buf[4] as u16) << 8) | buf[5] as u16,
        )),
        COMPACT_SOCKADDR_V6_LEN => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);

            Ok(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                ((buf[16] as u16) << 8) | buf[17] as u16,
            ))
        }
        _ => bail!(
            "socketaddr_from_compact_bytes: buffer len expected {} or {} found {}",
            COMPACT_SOCKADDR_V4_LEN,
            COMPACT_SOCKADDR_V6_LEN,
            buf.len()
        ),
    }
}

pub fn compact_bytes_from_socketaddr(addr: &SocketAddr) -> Vec<u8> {
    let mut rv = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    rv.extend_from_slice(&addr.port().to_be_bytes());
    rv
}
