use crate::peers::peer::Peer;
use crate::transcoding::{COMPACT_SOCKADDR_V4_LEN, COMPACT_SOCKADDR_V6_LEN};
use crate::ok_or_missing_field;
use anyhow::Result;
use bendy::decoding::{FromBencode, Object};
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub failure_reason: Option<String>,
    pub warning_message: Option<String>,
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<Peer>,
}

fn compact_peers(bytes: &[u8], chunk_len: usize) -> Vec<Peer> {
    bytes
        .chunks_exact(chunk_len)
        .filter_map(|compact_peer| match Peer::from_compact_bytes(compact_peer) {
            Ok(peer) => Some(peer),
            Err(e) => {
                warn!(?e);
                None
            }
        })
        .collect()
}

/// Non-compact form, a list of `{peer id, ip, port}` dictionaries.
fn dictionary_peers(object: Object) -> Result<Vec<Peer>, bendy::decoding::Error> {
    let mut peers = Vec::new();
    let mut list = object.try_into_list()?;

    while let Some(item) = list.next_object()? {
        let mut ip = None;
        let mut port = None;

        let mut dict = item.try_into_dictionary()?;
        while let Some(kv) = dict.next_pair()? {
            match kv {
                (b"ip", value) => ip = Some(String::decode_bencode_object(value)?),
                (b"port", value) => port = Some(u16::decode_bencode_object(value)?),
                _ => (),
            }
        }

        let ip = ok_or_missing_field!(ip)?;
        let port = ok_or_missing_field!(port)?;

        match ip.parse::<IpAddr>() {
            Ok(ip) => peers.push(Peer::new(SocketAddr::new(ip, port))),
            Err(_) => warn!(%ip, "tracker sent a hostname, skipped"),
        }
    }

    Ok(peers)
}

impl FromBencode for Response {
    const EXPECTED_RECURSION_DEPTH: usize = 4;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut failure_reason = None;
        let mut warning_message = None;
        let mut interval = None;
        let mut min_interval = None;
        let mut tracker_id = None;
        let mut complete = None;
        let mut incomplete = None;
        let mut peers = Vec::new();

        let mut info = object.try_into_dictionary()?;
        while let Some(kv) = info.next_pair()? {
            match kv {
                (b"failure reason", value) => {
                    failure_reason = Some(String::decode_bencode_object(value)?);
                }
                (b"warning message", value) => {
                    warning_message = Some(String::decode_bencode_object(value)?);
                }
                (b"interval", value) => {
                    interval = Some(u64::decode_bencode_object(value)?);
                }
                (b"min interval", value) => {
                    min_interval = Some(u64::decode_bencode_object(value)?);
                }
                (b"tracker id", value) => {
                    tracker_id = Some(String::decode_bencode_object(value)?);
                }
                (b"complete", value) => {
                    complete = Some(u64::decode_bencode_object(value)?);
                }
                (b"incomplete", value) => {
                    incomplete = Some(u64::decode_bencode_object(value)?);
                }
                (b"peers", Object::Bytes(bytes)) => {
                    peers.extend(compact_peers(bytes, COMPACT_SOCKADDR_V4_LEN));
                }
                (b"peers", value) => {
                    peers.extend(dictionary_peers(value)?);
                }
                (b"peers6", value) => {
                    let bytes = value.try_into_bytes()?;
                    peers.extend(compact_peers(bytes, COMPACT_SOCKADDR_V6_LEN));
                }
                _ => (),
            }
        }

        if failure_reason.is_some() {
            return Ok(Response {
                failure_reason,
                ..Response::default()
            });
        }

        Ok(Response {
            failure_reason,
            warning_message,
            interval: ok_or_missing_field!(interval)?,
            min_interval,
            tracker_id,
            complete,
            incomplete,
            peers,
        })
    }
}
