use crate::data_structures::ID;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Announce {
    pub tracker_url: String,
    pub info_hash: ID,
    pub peer_id: ID,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub compact: bool,
    pub no_peer_id: bool,
    /// `None` is the regular re-announce.
    pub event: Option<AnnounceEvent>,
    pub tracker_id: Option<String>,
}

impl Announce {
    pub fn as_url(&self) -> String {
        let mut s = self.tracker_url.clone();

        s.push(if s.contains('?') { '&' } else { '?' });
        s.push_str("info_hash=");
        s.push_str(urlencoding::encode_binary(self.info_hash.as_byte_ref()).as_ref());

        s.push_str("&peer_id=");
        s.push_str(urlencoding::encode_binary(self.peer_id.as_byte_ref()).as_ref());

        if let Some(ip) = &self.ip {
            s.push_str("&ip=");
            s.push_str(urlencoding::encode(&ip.to_string()).as_ref());
        }

        s.push_str("&port=");
        s.push_str(&self.port.to_string());

        s.push_str("&uploaded=");
        s.push_str(&self.uploaded.to_string());

        s.push_str("&downloaded=");
        s.push_str(&self.downloaded.to_string());

        s.push_str("&left=");
        s.push_str(&self.left.to_string());

        s.push_str("&compact=");
        s.push_str(&(if self.compact { 1 } else { 0 }).to_string());

        if !self.compact {
            s.push_str("&no_peer_id=");
            s.push_str(&(if self.no_peer_id { 1 } else { 0 }).to_string());
        }

        if let Some(event) = &self.event {
            s.push_str("&event=");
            s.push_str(match event {
                AnnounceEvent::Started => "started",
                AnnounceEvent::Stopped => "stopped",
                AnnounceEvent::Completed => "completed",
            });
        }

        if let Some(tracker_id) = &self.tracker_id {
            s.push_str("&trackerid=");
            s.push_str(urlencoding::encode(tracker_id).as_ref());
        }

        s
    }
}

#[cfg(test)]
mod tests {
    use super::{Announce, AnnounceEvent};
    use crate::data_structures::{ID, ID_LEN};

    const TRACKER_URL: &str = "http://example.com/announce";
    const INFO_HASH: [u8; ID_LEN] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0];
    const PEER_ID: [u8; ID_LEN] = [
        11, 22, 33, 44, 55, 66, 77, 88, 99, 0, 11, 22, 33, 44, 55, 66, 77, 88, 99, 0,
    ];
    const ENCODED_URL: &str = "http://example.com/announce?info_hash=%01%02%03%04%05%06%07%08%09%00%01%02%03%04%05%06%07%08%09%00&peer_id=%0B%16%21%2C7BMXc%00%0B%16%21%2C7BMXc%00&ip=192.168.1.20&port=6887&uploaded=776241&downloaded=277518&left=78907&compact=1&event=started";

    fn announce() -> Announce {
        Announce {
            tracker_url: TRACKER_URL.to_string(),
            info_hash: ID::new(INFO_HASH),
            peer_id: ID::new(PEER_ID),
            ip: Some("192.168.1.20".parse().unwrap()),
            port: 6887,
            uploaded: 776241,
            downloaded: 277518,
            left: 78907,
            compact: true,
            no_peer_id: true,
            event: Some(AnnounceEvent::Started),
            tracker_id: None,
        }
    }

    #[test]
    fn announce_as_url() {
        assert_eq!(announce().as_url(), ENCODED_URL);
    }

    #[test]
    fn regular_announce_with_tracker_id() {
        let mut announce = announce();
        announce.tracker_url = "http://example.com/announce?passkey=abc".to_string();
        announce.ip = None;
        announce.event = None;
        announce.tracker_id = Some("t 1".to_string());

        let url = announce.as_url();

        assert!(url.starts_with("http://example.com/announce?passkey=abc&info_hash="));
        assert!(!url.contains("event="));
        assert!(!url.contains("&ip="));
        assert!(url.ends_with("&compact=1&trackerid=t%201"));
    }
}
